/// Statement AST rewriting.
///
/// Pass-based transformation of translated statements. Each pass takes a
/// statement and returns a possibly modified one without changing what it
/// selects. Domain filters are built against a placeholder root alias and
/// spliced into a caller's statement with [`RenameAlias`].
use super::types::*;

/// A single transformation over a statement.
pub trait RewritePass: Send + Sync {
    /// Unique name identifying this pass.
    fn name(&self) -> &str;

    fn transform(&self, select: SelectQuery) -> SelectQuery;
}

/// Runs a pipeline of passes in order.
#[derive(Default)]
pub struct Rewriter {
    passes: Vec<Box<dyn RewritePass>>,
}

impl Rewriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pipeline applied to every compiled statement.
    pub fn with_defaults() -> Self {
        let mut rewriter = Self::new();
        rewriter.add_pass(Box::new(RemoveRedundantNesting));
        rewriter
    }

    pub fn add_pass(&mut self, pass: Box<dyn RewritePass>) {
        self.passes.push(pass);
    }

    pub fn rewrite(&self, select: SelectQuery) -> SelectQuery {
        self.passes
            .iter()
            .fold(select, |current, pass| pass.transform(current))
    }
}

/// Removes parentheses around atoms: `((t0.x))` → `t0.x`.
pub struct RemoveRedundantNesting;

impl RewritePass for RemoveRedundantNesting {
    fn name(&self) -> &str {
        "remove_redundant_nesting"
    }

    fn transform(&self, select: SelectQuery) -> SelectQuery {
        map_select(select, &mut |expr| match expr {
            Expression::Nested(inner) => match *inner {
                atom @ (Expression::Column { .. }
                | Expression::Literal(_)
                | Expression::Function { .. }
                | Expression::Subquery(_)) => atom,
                other => Expression::Nested(Box::new(other)),
            },
            other => other,
        })
    }
}

/// Renames the alias `from` to `to` wherever it appears: column qualifiers,
/// including references from inside correlated subqueries, and the tables
/// that declare it.
pub struct RenameAlias {
    pub from: String,
    pub to: String,
}

impl RewritePass for RenameAlias {
    fn name(&self) -> &str {
        "rename_alias"
    }

    fn transform(&self, select: SelectQuery) -> SelectQuery {
        let mut select = self.rename_tables(map_select(select, &mut |expr| self.rename(expr)));
        select.projections = select
            .projections
            .into_iter()
            .map(|item| match item {
                SelectItem::QualifiedWildcard(t) if t == self.from => {
                    SelectItem::QualifiedWildcard(self.to.clone())
                }
                other => other,
            })
            .collect();
        select
    }
}

impl RenameAlias {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        RenameAlias {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Apply the rename to a standalone expression.
    pub fn rename_expr(&self, expr: Expression) -> Expression {
        map_expr(expr, &mut |e| self.rename(e))
    }

    pub fn rename_join(&self, join: Join) -> Join {
        Join {
            join_type: join.join_type,
            table: self.rename_table(map_table(join.table, &mut |e| self.rename(e))),
            on: self.rename_expr(join.on),
        }
    }

    fn rename(&self, expr: Expression) -> Expression {
        match expr {
            Expression::Column {
                table: Some(t),
                name,
            } if t == self.from => Expression::Column {
                table: Some(self.to.clone()),
                name,
            },
            Expression::Subquery(q) => Expression::Subquery(Box::new(self.rename_tables(*q))),
            Expression::Exists(q) => Expression::Exists(Box::new(self.rename_tables(*q))),
            other => other,
        }
    }

    fn rename_tables(&self, mut select: SelectQuery) -> SelectQuery {
        select.from = select.from.map(|t| self.rename_table(t));
        select.joins = select
            .joins
            .into_iter()
            .map(|j| Join {
                table: self.rename_table(j.table),
                ..j
            })
            .collect();
        select
    }

    fn rename_table(&self, table: TableRef) -> TableRef {
        match table {
            TableRef::Table {
                name,
                alias: Some(alias),
            } if alias == self.from => TableRef::Table {
                name,
                alias: Some(self.to.clone()),
            },
            TableRef::Subquery { query, alias } => TableRef::Subquery {
                query: Box::new(self.rename_tables(*query)),
                alias: if alias == self.from {
                    self.to.clone()
                } else {
                    alias
                },
            },
            other => other,
        }
    }
}

type ExprFn<'a> = dyn FnMut(Expression) -> Expression + 'a;

/// Post-order rewrite of every expression in a statement.
fn map_select(mut select: SelectQuery, f: &mut ExprFn<'_>) -> SelectQuery {
    select.projections = select
        .projections
        .into_iter()
        .map(|item| match item {
            SelectItem::Expression { expr, alias } => SelectItem::Expression {
                expr: map_expr(expr, f),
                alias,
            },
            other => other,
        })
        .collect();
    select.from = select.from.map(|t| map_table(t, f));
    select.joins = select
        .joins
        .into_iter()
        .map(|j| Join {
            join_type: j.join_type,
            table: map_table(j.table, f),
            on: map_expr(j.on, f),
        })
        .collect();
    select.filter = select.filter.map(|e| map_expr(e, f));
    select.group_by = select.group_by.into_iter().map(|e| map_expr(e, f)).collect();
    select.order_by = select
        .order_by
        .into_iter()
        .map(|o| OrderByExpr {
            expr: map_expr(o.expr, f),
            asc: o.asc,
        })
        .collect();
    select
}

fn map_table(table: TableRef, f: &mut ExprFn<'_>) -> TableRef {
    match table {
        TableRef::Subquery { query, alias } => TableRef::Subquery {
            query: Box::new(map_select(*query, f)),
            alias,
        },
        other => other,
    }
}

fn map_boxed(expr: Box<Expression>, f: &mut ExprFn<'_>) -> Box<Expression> {
    Box::new(map_expr(*expr, f))
}

fn map_expr(expr: Expression, f: &mut ExprFn<'_>) -> Expression {
    let mapped = match expr {
        Expression::BinaryOp { left, op, right } => Expression::BinaryOp {
            left: map_boxed(left, f),
            op,
            right: map_boxed(right, f),
        },
        Expression::UnaryOp { op, expr } => Expression::UnaryOp {
            op,
            expr: map_boxed(expr, f),
        },
        Expression::Function {
            name,
            args,
            distinct,
        } => Expression::Function {
            name,
            args: args.into_iter().map(|a| map_expr(a, f)).collect(),
            distinct,
        },
        Expression::Case {
            when_clauses,
            else_clause,
        } => Expression::Case {
            when_clauses: when_clauses
                .into_iter()
                .map(|(w, t)| (map_expr(w, f), map_expr(t, f)))
                .collect(),
            else_clause: else_clause.map(|e| map_boxed(e, f)),
        },
        Expression::Subquery(q) => Expression::Subquery(Box::new(map_select(*q, f))),
        Expression::Exists(q) => Expression::Exists(Box::new(map_select(*q, f))),
        Expression::InList {
            expr,
            list,
            negated,
        } => Expression::InList {
            expr: map_boxed(expr, f),
            list: list.into_iter().map(|e| map_expr(e, f)).collect(),
            negated,
        },
        Expression::IsNull { expr, negated } => Expression::IsNull {
            expr: map_boxed(expr, f),
            negated,
        },
        Expression::Cast { expr, data_type } => Expression::Cast {
            expr: map_boxed(expr, f),
            data_type,
        },
        Expression::Array(items) => {
            Expression::Array(items.into_iter().map(|e| map_expr(e, f)).collect())
        }
        Expression::JsonAccess {
            expr,
            path,
            as_text,
        } => Expression::JsonAccess {
            expr: map_boxed(expr, f),
            path: map_boxed(path, f),
            as_text,
        },
        Expression::TypeCast { expr, data_type } => Expression::TypeCast {
            expr: map_boxed(expr, f),
            data_type,
        },
        Expression::Nested(inner) => Expression::Nested(map_boxed(inner, f)),
        leaf @ (Expression::Column { .. }
        | Expression::Literal(_)
        | Expression::Wildcard
        | Expression::Raw(_)) => leaf,
    };
    f(mapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::compiler::compile;

    fn correlated_filter() -> SelectQuery {
        let mut inner = SelectQuery::from_table("stages", "f1");
        inner.projections.push(SelectItem::Expression {
            expr: Expression::Raw("1".into()),
            alias: None,
        });
        inner.and_where(Expression::binary(
            Expression::column("f1", "id"),
            BinaryOperator::Eq,
            Expression::column("root", "stageId"),
        ));
        let mut q = SelectQuery::from_table("pubs", "root");
        q.projections.push(SelectItem::QualifiedWildcard("root".into()));
        q.and_where(Expression::Exists(Box::new(inner)));
        q
    }

    #[test]
    fn test_rename_alias_reaches_subqueries() {
        let renamed = RenameAlias::new("root", "p").transform(correlated_filter());
        let sql = compile(&renamed);
        assert!(sql.starts_with("SELECT p.* FROM pubs AS p"));
        assert!(sql.contains("f1.id = p.\"stageId\""));
        assert!(!sql.contains("root"));
    }

    #[test]
    fn test_rename_alias_reaches_declaring_tables() {
        let renamed = RenameAlias::new("f1", "g1").transform(correlated_filter());
        let sql = compile(&renamed);
        assert!(sql.contains("EXISTS (SELECT 1 FROM stages AS g1 WHERE g1.id = root.\"stageId\")"));

        let join = Join {
            join_type: JoinType::Left,
            table: TableRef::Table {
                name: "stages".into(),
                alias: Some("f1".into()),
            },
            on: Expression::binary(
                Expression::column("f1", "id"),
                BinaryOperator::Eq,
                Expression::column("root", "stageId"),
            ),
        };
        let renamed = RenameAlias::new("f1", "g1").rename_join(join);
        assert_eq!(
            renamed.table,
            TableRef::Table {
                name: "stages".into(),
                alias: Some("g1".into()),
            }
        );
        assert_eq!(
            renamed.on,
            Expression::binary(
                Expression::column("g1", "id"),
                BinaryOperator::Eq,
                Expression::column("root", "stageId"),
            )
        );
    }

    #[test]
    fn test_remove_redundant_nesting() {
        let mut q = SelectQuery::from_table("pubs", "t0");
        q.and_where(Expression::Nested(Box::new(Expression::Nested(Box::new(
            Expression::column("t0", "flag"),
        )))));
        let out = Rewriter::with_defaults().rewrite(q);
        assert_eq!(out.filter, Some(Expression::column("t0", "flag")));
    }
}
