//! Path analysis.
//!
//! A path is folded left to right into one accumulator: the first step picks
//! the row source (a `$$table` root or a relation of the table in scope),
//! bracket stages become filters or windows, relation steps become joins,
//! sort steps become ORDER BY terms and the trailing step becomes the
//! projection. Full statements, nested subqueries and `QueryParts` are all
//! built from the same [`PathAcc`].
use tracing::trace;

use super::context::{Context, TableScope, TranslationMode};
use super::expr::Translator;
use super::functions::typed;
use super::joins::JoinSet;
use crate::error::{Result, TranslateError};
use crate::expr::{ExprNode, Step, UnaryNode};
use crate::schema::FieldType;
use crate::sql::{Expression, Literal, OrderByExpr, SelectItem, SelectQuery, TableRef};

/// LIMIT/OFFSET accumulated from index and range stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Window {
    pub offset: u64,
    pub limit: Option<u64>,
}

impl Window {
    /// Keep `count` rows starting at `start` of the current window.
    pub fn narrow(&mut self, start: u64, count: u64) {
        let available = self.limit.map(|l| l.saturating_sub(start));
        self.offset += start;
        self.limit = Some(match available {
            Some(a) => a.min(count),
            None => count,
        });
    }

    pub fn is_limited(&self) -> bool {
        self.limit.is_some() || self.offset > 0
    }

    /// OFFSET clause value; a zero offset is omitted.
    pub fn offset(&self) -> Option<u64> {
        (self.offset > 0).then_some(self.offset)
    }
}

/// What the path yields per row.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// The whole row of the tail table.
    Row,
    Column {
        expr: Expression,
        name: String,
        field_type: FieldType,
    },
    /// Trailing object constructor: one value per key.
    Object(Vec<(String, Expression)>),
    /// Any other trailing expression.
    Value(Expression),
}

/// Whether the folded path is a statement of its own or nested in another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRole {
    Statement,
    Nested,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathAcc {
    /// Source text of the path, for error messages.
    pub source: String,
    pub root: TableScope,
    pub physical_table: String,
    /// Correlation with the enclosing row, for nested paths.
    pub link: Option<Expression>,
    pub filters: Vec<Expression>,
    pub order_by: Vec<OrderByExpr>,
    pub window: Window,
    pub projection: Projection,
    /// Table the trailing step resolves against.
    pub tail: TableScope,
    pub joins: JoinSet,
    /// Whether more than one row may match per enclosing row.
    pub to_many: bool,
}

impl PathAcc {
    pub fn projects_rows(&self) -> bool {
        self.projection == Projection::Row
    }

    /// Per-row value of the path as a single expression.
    pub fn item(&self) -> Expression {
        match &self.projection {
            Projection::Row => row_json(&self.tail.alias),
            Projection::Column { expr, .. } => expr.clone(),
            Projection::Object(pairs) => json_object(pairs),
            Projection::Value(expr) => expr.clone(),
        }
    }

    /// Select list for a top-level statement.
    pub fn select_items(&self) -> Vec<SelectItem> {
        match &self.projection {
            Projection::Row => vec![SelectItem::QualifiedWildcard(self.tail.alias.clone())],
            Projection::Column { expr, .. } => vec![SelectItem::Expression {
                expr: expr.clone(),
                alias: None,
            }],
            Projection::Object(pairs) => pairs
                .iter()
                .map(|(key, value)| SelectItem::Expression {
                    expr: value.clone(),
                    alias: Some(key.clone()),
                })
                .collect(),
            Projection::Value(expr) => vec![SelectItem::Expression {
                expr: expr.clone(),
                alias: Some("result".into()),
            }],
        }
    }

    /// WHERE conditions including the correlation predicate.
    pub fn conditions(&self) -> Vec<Expression> {
        self.link
            .iter()
            .cloned()
            .chain(self.filters.iter().cloned())
            .collect()
    }

    /// `SELECT <items> FROM root [joins] WHERE ... ORDER BY ... LIMIT ... OFFSET ...`
    pub fn to_select(&self, items: Vec<SelectItem>) -> SelectQuery {
        SelectQuery {
            projections: items,
            from: Some(TableRef::Table {
                name: self.physical_table.clone(),
                alias: Some(self.root.alias.clone()),
            }),
            joins: self.joins.to_joins(),
            filter: Expression::conjunction(self.conditions()),
            order_by: self.order_by.clone(),
            limit: self.window.limit,
            offset: self.window.offset(),
            ..Default::default()
        }
    }
}

/// `to_jsonb(alias)`: a whole row as one JSON value.
pub(crate) fn row_json(alias: &str) -> Expression {
    Expression::function(
        "to_jsonb",
        vec![Expression::Column {
            table: None,
            name: alias.to_string(),
        }],
    )
}

pub(crate) fn json_object(pairs: &[(String, Expression)]) -> Expression {
    let args = pairs
        .iter()
        .flat_map(|(key, value)| {
            [
                Expression::TypeCast {
                    expr: Box::new(Expression::Literal(Literal::String(key.clone()))),
                    data_type: "text".into(),
                },
                value.clone(),
            ]
        })
        .collect();
    Expression::function("json_build_object", args)
}

/// Drop a leading bare `$` (the row in scope) when more steps follow.
pub(crate) fn strip_context_step(steps: &[Step]) -> &[Step] {
    match steps.split_first() {
        Some((first, rest))
            if !rest.is_empty()
                && first.stages.is_empty()
                && matches!(&first.node, ExprNode::Variable(name) if name.is_empty()) =>
        {
            rest
        }
        _ => steps,
    }
}

fn path_text(steps: &[Step]) -> String {
    ExprNode::Path(steps.to_vec()).to_string()
}

impl Translator<'_> {
    /// Steps of `node` when it navigates away from the row in scope: a
    /// `$$table` path, or a path starting with a relation of the current
    /// table.
    pub(crate) fn navigation(&self, node: &ExprNode, ctx: &Context) -> Option<Vec<Step>> {
        let steps = match node {
            ExprNode::Path(steps) => strip_context_step(steps).to_vec(),
            ExprNode::Variable(_) if node.table_root().is_some() => vec![Step::new(node.clone())],
            ExprNode::Name(_) => vec![Step::new(node.clone())],
            _ => return None,
        };
        let first = steps.first()?;
        if first.node.table_root().is_some() {
            return Some(steps);
        }
        match &first.node {
            ExprNode::Name(name) => {
                let scope = ctx.current.as_ref()?;
                let table = self.schema.table(&scope.table).ok()?;
                table.relation(name).map(|_| steps)
            }
            _ => None,
        }
    }

    /// Fold a navigation path into an accumulator, in its own join frame.
    pub(crate) fn fold_path(
        &mut self,
        steps: &[Step],
        ctx: &Context,
        role: PathRole,
    ) -> Result<PathAcc> {
        let (mut acc, joins) = self.in_frame(|t| t.fold_steps(steps, ctx, role))?;
        acc.joins = joins;
        trace!(
            path = %acc.source,
            filters = acc.filters.len(),
            joins = acc.joins.len(),
            "Folded path"
        );
        Ok(acc)
    }

    fn fold_steps(&mut self, steps: &[Step], ctx: &Context, role: PathRole) -> Result<PathAcc> {
        let source = path_text(steps);
        let first = steps
            .first()
            .ok_or_else(|| TranslateError::malformed("empty path", &source))?;

        let alias = self.aliases.generate();
        let (root, link, to_many) = match (&first.node, first.node.table_root()) {
            (_, Some(table)) => {
                self.schema.table(table)?;
                let root = TableScope::new(table, &alias);
                match &ctx.current {
                    Some(outer) => {
                        let (link, to_one) = self.table_link(outer, table, &alias)?;
                        (root, Some(link), !to_one)
                    }
                    None => (root, None, true),
                }
            }
            (ExprNode::Name(name), None) => {
                let outer = ctx.scope(name)?;
                let table = self.schema.table(&outer.table)?;
                let rel = table.relation(name).ok_or_else(|| {
                    TranslateError::schema(format!(
                        "table '{}' has no relation '{}'",
                        outer.table, name
                    ))
                })?;
                let link = self.relation_link(outer, rel, &alias)?;
                (
                    TableScope::new(&rel.target_table, &alias),
                    Some(link),
                    !rel.to_one,
                )
            }
            (other, None) => {
                return Err(TranslateError::malformed(
                    format!("path cannot start at `{}`", other),
                    &source,
                ))
            }
        };

        let physical_table = self.schema.table(&root.table)?.physical_name.clone();
        let row_ctx = match role {
            PathRole::Statement => ctx.at(root.clone()).with_mode(TranslationMode::Filter),
            PathRole::Nested => ctx.nested(root.clone(), TranslationMode::Filter),
        };
        let value_mode = match role {
            PathRole::Statement => TranslationMode::Projection,
            PathRole::Nested => TranslationMode::Subquery,
        };

        let mut acc = PathAcc {
            source: source.clone(),
            root: root.clone(),
            physical_table,
            link,
            filters: Vec::new(),
            order_by: Vec::new(),
            window: Window::default(),
            projection: Projection::Row,
            tail: root.clone(),
            joins: JoinSet::default(),
            to_many,
        };

        for stage in &first.stages {
            self.apply_stage(stage, &row_ctx, &mut acc)?;
        }

        let mut scope = root;
        let rest = &steps[1..];
        let mut index = 0;
        while index < rest.len() {
            let step = &rest[index];
            let last = index + 1 == rest.len();
            let here = row_ctx.at(scope.clone());
            match &step.node {
                ExprNode::Sort(terms) => {
                    let order_ctx = here.with_mode(TranslationMode::Order);
                    for term in terms {
                        let expr = self.expression(&term.expr, &order_ctx)?;
                        acc.order_by.push(OrderByExpr {
                            expr,
                            asc: if term.descending { Some(false) } else { None },
                        });
                    }
                }
                ExprNode::Variable(name) if name.is_empty() => {}
                ExprNode::Name(name) => {
                    let table = self.schema.table(&scope.table)?;
                    if let Some(rel) = table.relation(name) {
                        let to_one = rel.to_one;
                        let spec = self.resolve_relation(&scope, name)?;
                        if role == PathRole::Statement {
                            // Rows without a match are missing values, not null rows.
                            acc.filters.push(Expression::IsNull {
                                expr: Box::new(Expression::column(
                                    &spec.target_alias,
                                    &spec.target_key,
                                )),
                                negated: true,
                            });
                        }
                        acc.to_many |= !to_one;
                        scope = spec.target_scope();
                    } else if let Some((column, field_type)) = table.column(name) {
                        if !step.stages.is_empty() {
                            return Err(TranslateError::unsupported(
                                "predicate on a field step (apply it to the table step)",
                                &source,
                            ));
                        }
                        let base = Expression::column(&scope.alias, &column);
                        let expr = json_navigation(base, field_type, &rest[index + 1..], &source)?;
                        let json_path = index + 1 < rest.len();
                        acc.projection = Projection::Column {
                            expr,
                            name: column,
                            field_type: if json_path { FieldType::Json } else { field_type },
                        };
                        acc.tail = scope;
                        return Ok(acc);
                    } else {
                        return Err(TranslateError::schema(format!(
                            "table '{}' has no field or relation '{}'",
                            scope.table, name
                        )));
                    }
                }
                ExprNode::Unary(UnaryNode::Object(pairs)) if last => {
                    let values = self.object_values(pairs, &here.with_mode(value_mode))?;
                    acc.projection = Projection::Object(values);
                }
                other if last => {
                    let value = self.expression(other, &here.with_mode(value_mode))?;
                    acc.projection = Projection::Value(value);
                }
                other => {
                    return Err(TranslateError::unsupported(
                        format!("navigation past `{}`", other),
                        &source,
                    ))
                }
            }
            let stage_ctx = row_ctx.at(scope.clone());
            for stage in &step.stages {
                self.apply_stage(stage, &stage_ctx, &mut acc)?;
            }
            index += 1;
        }
        acc.tail = scope;
        Ok(acc)
    }

    /// Index, range or predicate stage.
    fn apply_stage(&mut self, stage: &ExprNode, ctx: &Context, acc: &mut PathAcc) -> Result<()> {
        if let Some(n) = stage.as_index() {
            if n < 0 {
                return Err(TranslateError::unsupported("negative index", stage));
            }
            acc.window.narrow(n as u64, 1);
            return Ok(());
        }
        if let ExprNode::Number(_) = stage {
            return Err(TranslateError::malformed("index must be a safe integer", stage));
        }
        if let Some((start, end)) = stage.as_bracketed_range() {
            let (start, end) = match (start.as_index(), end.as_index()) {
                (Some(s), Some(e)) => (s, e),
                _ => {
                    return Err(TranslateError::unsupported(
                        "range bounds must be integer literals",
                        stage,
                    ))
                }
            };
            if start < 0 || end < 0 {
                return Err(TranslateError::unsupported("negative index", stage));
            }
            let count = if end >= start { end - start + 1 } else { 0 };
            acc.window.narrow(start as u64, count as u64);
            return Ok(());
        }
        if let ExprNode::Unary(UnaryNode::Array(_)) = stage {
            return Err(TranslateError::unsupported("array predicate", stage));
        }
        let condition = self.condition(stage, ctx)?;
        acc.filters.push(condition);
        Ok(())
    }

    /// Object-constructor values, each compiled from its own copy of `ctx`.
    pub(crate) fn object_values(
        &mut self,
        pairs: &[(ExprNode, ExprNode)],
        ctx: &Context,
    ) -> Result<Vec<(String, Expression)>> {
        pairs
            .iter()
            .map(|(key, value)| {
                let key = match key {
                    ExprNode::String(k) => k.clone(),
                    other => {
                        return Err(TranslateError::malformed(
                            "object keys must be string literals",
                            other,
                        ))
                    }
                };
                let value = typed(self.translate(value, ctx)?);
                Ok((key, value))
            })
            .collect()
    }
}

/// `base -> 'a' -> 'b'` for name steps below a JSON field.
pub(crate) fn json_navigation(
    base: Expression,
    field_type: FieldType,
    steps: &[Step],
    source: &str,
) -> Result<Expression> {
    if steps.is_empty() {
        return Ok(base);
    }
    if field_type != FieldType::Json {
        return Err(TranslateError::unsupported(
            "navigation into a non-JSON field",
            source,
        ));
    }
    steps.iter().try_fold(base, |acc, step| match &step.node {
        ExprNode::Name(key) if step.stages.is_empty() => Ok(Expression::JsonAccess {
            expr: Box::new(acc),
            path: Box::new(Expression::TypeCast {
                expr: Box::new(Expression::Literal(Literal::String(key.clone()))),
                data_type: "text".into(),
            }),
            as_text: false,
        }),
        other => Err(TranslateError::unsupported(
            format!("JSON navigation through `{}`", other),
            source,
        )),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parse;
    use crate::schema::test_schema;
    use crate::sql::compile;
    use crate::translate::expr::Params;

    fn fold(text: &str) -> PathAcc {
        let schema = test_schema();
        let params = Params::new();
        let mut t = Translator::new(&schema, &params);
        let node = parse(text).unwrap();
        let steps = match node.as_ref() {
            ExprNode::Path(steps) => steps.clone(),
            other => vec![Step::new(other.clone())],
        };
        t.fold_path(&steps, &Context::root(), PathRole::Statement)
            .unwrap()
    }

    #[test]
    fn test_window_narrowing() {
        let mut w = Window::default();
        w.narrow(2, 4);
        assert_eq!((w.offset, w.limit), (2, Some(4)));
        w.narrow(1, 1);
        assert_eq!((w.offset, w.limit), (3, Some(1)));
        w.narrow(5, 1);
        assert_eq!(w.limit, Some(0));
        assert_eq!(Window::default().offset(), None);
    }

    #[test]
    fn test_fold_index_and_range() {
        let acc = fold("$$pubs[0]");
        assert_eq!(acc.window.limit, Some(1));
        assert_eq!(acc.window.offset(), None);

        let acc = fold("$$pubs[[2..5]]");
        assert_eq!(acc.window.limit, Some(4));
        assert_eq!(acc.window.offset(), Some(2));
    }

    #[test]
    fn test_fold_sort_then_window() {
        let acc = fold("$$pubs^(>createdAt)[[0..4]]");
        assert_eq!(acc.order_by.len(), 1);
        assert_eq!(acc.order_by[0].asc, Some(false));
        assert_eq!(acc.window.limit, Some(5));
        assert!(acc.filters.is_empty());
    }

    #[test]
    fn test_fold_projection_column_through_join() {
        let acc = fold("$$pubs.stage.name");
        assert_eq!(acc.joins.len(), 1);
        assert_eq!(acc.tail.table, "stages");
        match &acc.projection {
            Projection::Column { name, .. } => assert_eq!(name, "name"),
            other => panic!("Expected column projection, got {:?}", other),
        }
    }

    #[test]
    fn test_fold_relation_tail_drops_unmatched_rows() {
        let acc = fold("$$pubs.stage");
        assert!(acc.projects_rows());
        let sql = compile(&acc.to_select(acc.select_items()));
        assert_eq!(
            sql,
            "SELECT t1.* FROM pubs AS t0 LEFT JOIN stages AS t1 ON t1.id = t0.\"stageId\" \
             WHERE t1.id IS NOT NULL"
        );

        let acc = fold("$$pubs.stage.name");
        assert_eq!(acc.filters.len(), 1);
    }

    #[test]
    fn test_fold_object_projection() {
        let acc = fold("$$pubs.{\"t\": title, \"s\": stage.name}");
        let sql = compile(&acc.to_select(acc.select_items()));
        assert_eq!(
            sql,
            "SELECT t0.title AS t, t1.name AS s FROM pubs AS t0 \
             LEFT JOIN stages AS t1 ON t1.id = t0.\"stageId\""
        );
    }

    #[test]
    fn test_fold_rejects_negative_index() {
        let schema = test_schema();
        let params = Params::new();
        let mut t = Translator::new(&schema, &params);
        let node = parse("$$pubs[-1]").unwrap();
        let steps = match node.as_ref() {
            ExprNode::Path(steps) => steps.clone(),
            _ => unreachable!(),
        };
        let err = t
            .fold_path(&steps, &Context::root(), PathRole::Statement)
            .unwrap_err();
        assert_eq!(err.kind(), "UnsupportedConstructError");
    }

    #[test]
    fn test_fold_rejects_inexact_index() {
        let schema = test_schema();
        let params = Params::new();
        for input in ["$$pubs[1e20]", "$$pubs[1.5]", "$$pubs[[0..1e20]]"] {
            let mut t = Translator::new(&schema, &params);
            let node = parse(input).unwrap();
            let steps = match node.as_ref() {
                ExprNode::Path(steps) => steps.clone(),
                other => vec![Step::new(other.clone())],
            };
            assert!(
                t.fold_path(&steps, &Context::root(), PathRole::Statement)
                    .is_err(),
                "{} should fail",
                input
            );
        }
    }

    #[test]
    fn test_json_navigation() {
        let base = Expression::column("t1", "value");
        let steps = vec![Step::new(ExprNode::Name("color".into()))];
        let expr = json_navigation(base.clone(), FieldType::Json, &steps, "value.color").unwrap();
        assert!(matches!(expr, Expression::JsonAccess { as_text: false, .. }));
        assert!(json_navigation(base, FieldType::Text, &steps, "title.color").is_err());
    }
}
