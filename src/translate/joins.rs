//! Join & subquery resolution.
//!
//! Relation steps used as plain values become LEFT JOINs registered on the
//! statement being built, deduplicated by `(source alias, relation)` so a
//! relation mentioned twice never multiplies rows. Everything that needs its
//! own row set (existence tests, aggregates, whole collections) becomes one of
//! three correlated subqueries built from a folded path:
//!
//! ```text
//! EXISTS (SELECT 1 FROM ... WHERE <link> AND <filters> AND <cond>)
//! (SELECT agg(...) FROM ... WHERE <link> AND <filters>)
//! (SELECT coalesce(json_agg(sN.item), '[]'::json) FROM (SELECT ... AS item ...) AS sN)
//! ```
//!
//! Correlation always goes through the relation's declared keys, so the same
//! code serves many-to-one and one-to-many links.
use tracing::trace;

use super::context::TableScope;
use super::expr::Translator;
use super::functions::Aggregate;
use super::path::PathAcc;
use crate::error::{Result, TranslateError};
use crate::schema::{Relation, TableDef};
use crate::sql::{
    BinaryOperator, Expression, Join, JoinType, SelectItem, SelectQuery, TableRef,
};

/// A LEFT JOIN registered while translating a relation step.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinSpec {
    pub source_alias: String,
    pub relation: String,
    pub target_alias: String,
    /// Logical name of the joined table.
    pub target_table: String,
    pub target_physical: String,
    /// Column on the source table.
    pub foreign_key: String,
    /// Column on the target table.
    pub target_key: String,
}

impl JoinSpec {
    pub fn on(&self) -> Expression {
        Expression::binary(
            Expression::column(&self.target_alias, &self.target_key),
            BinaryOperator::Eq,
            Expression::column(&self.source_alias, &self.foreign_key),
        )
    }

    pub fn to_join(&self) -> Join {
        Join {
            join_type: JoinType::Left,
            table: TableRef::Table {
                name: self.target_physical.clone(),
                alias: Some(self.target_alias.clone()),
            },
            on: self.on(),
        }
    }

    pub fn target_scope(&self) -> TableScope {
        TableScope::new(&self.target_table, &self.target_alias)
    }
}

/// Pending joins of one statement, in registration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinSet {
    specs: Vec<JoinSpec>,
}

impl JoinSet {
    pub fn get(&self, source_alias: &str, relation: &str) -> Option<&JoinSpec> {
        self.specs
            .iter()
            .find(|s| s.source_alias == source_alias && s.relation == relation)
    }

    pub fn insert(&mut self, spec: JoinSpec) {
        if self.get(&spec.source_alias, &spec.relation).is_none() {
            self.specs.push(spec);
        }
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &JoinSpec> {
        self.specs.iter()
    }

    pub fn to_joins(&self) -> Vec<Join> {
        self.specs.iter().map(JoinSpec::to_join).collect()
    }
}

/// Physical column behind a relation key; keys name fields, falling back to
/// the raw column name when the field is undeclared.
fn key_column(table: &TableDef, key: &str) -> String {
    table
        .column(key)
        .map(|(column, _)| column)
        .unwrap_or_else(|| key.to_string())
}

impl Translator<'_> {
    /// Run `f` against a fresh join set and hand back the joins it
    /// registered; the enclosing statement's joins are restored afterwards.
    pub(crate) fn in_frame<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<(T, JoinSet)> {
        let outer = std::mem::take(&mut self.joins);
        let result = f(self);
        let inner = std::mem::replace(&mut self.joins, outer);
        result.map(|value| (value, inner))
    }

    /// Register (or reuse) a LEFT JOIN for `relation` on `scope`.
    pub(crate) fn resolve_relation(
        &mut self,
        scope: &TableScope,
        relation: &str,
    ) -> Result<JoinSpec> {
        if let Some(existing) = self.joins.get(&scope.alias, relation) {
            trace!(alias = %scope.alias, relation, "Reusing join");
            return Ok(existing.clone());
        }
        let source = self.schema.table(&scope.table)?;
        let rel = source.relation(relation).ok_or_else(|| {
            TranslateError::schema(format!(
                "table '{}' has no relation '{}'",
                scope.table, relation
            ))
        })?;
        let target = self.schema.table(&rel.target_table)?;
        let spec = JoinSpec {
            source_alias: scope.alias.clone(),
            relation: relation.to_string(),
            target_alias: self.aliases.generate(),
            target_table: rel.target_table.clone(),
            target_physical: target.physical_name.clone(),
            foreign_key: key_column(source, &rel.foreign_key),
            target_key: key_column(target, &rel.target_key),
        };
        trace!(
            source = %spec.source_alias,
            target = %spec.target_alias,
            relation,
            "Registered join"
        );
        self.joins.insert(spec.clone());
        Ok(spec)
    }

    /// Correlation predicate for a relation declared on `outer`'s table,
    /// with the target table aliased `target_alias`.
    pub(crate) fn relation_link(
        &self,
        outer: &TableScope,
        rel: &Relation,
        target_alias: &str,
    ) -> Result<Expression> {
        let source = self.schema.table(&outer.table)?;
        let target = self.schema.table(&rel.target_table)?;
        Ok(Expression::binary(
            Expression::column(target_alias, key_column(target, &rel.target_key)),
            BinaryOperator::Eq,
            Expression::column(&outer.alias, key_column(source, &rel.foreign_key)),
        ))
    }

    /// Correlation predicate between `outer` and a nested `$$inner` path.
    ///
    /// Returns the predicate and whether at most one inner row matches.
    pub(crate) fn table_link(
        &self,
        outer: &TableScope,
        inner_table: &str,
        inner_alias: &str,
    ) -> Result<(Expression, bool)> {
        let (rel, declared_on_outer) = self.schema.relation_between(&outer.table, inner_table)?;
        if declared_on_outer {
            let link = self.relation_link(outer, rel, inner_alias)?;
            return Ok((link, rel.to_one));
        }
        // Declared on the inner table, pointing back at the outer one.
        let inner = self.schema.table(inner_table)?;
        let outer_def = self.schema.table(&outer.table)?;
        let link = Expression::binary(
            Expression::column(inner_alias, key_column(inner, &rel.foreign_key)),
            BinaryOperator::Eq,
            Expression::column(&outer.alias, key_column(outer_def, &rel.target_key)),
        );
        Ok((link, false))
    }

    /// `EXISTS (SELECT 1 ...)` over a folded path, with an optional extra
    /// condition on its rows.
    pub(crate) fn exists_subquery(&self, acc: &PathAcc, condition: Option<Expression>) -> Expression {
        let mut select = acc.to_select(vec![SelectItem::Expression {
            expr: Expression::Raw("1".into()),
            alias: None,
        }]);
        if !acc.window.is_limited() {
            select.order_by.clear();
        }
        if let Some(cond) = condition {
            select.and_where(cond);
        }
        Expression::Exists(Box::new(select))
    }

    /// Statement computing `aggregate` over a folded path's values.
    pub(crate) fn aggregate_statement(
        &mut self,
        acc: &PathAcc,
        aggregate: Aggregate,
        alias: Option<&str>,
    ) -> Result<SelectQuery> {
        let value = if acc.projects_rows() {
            if aggregate != Aggregate::Count {
                return Err(TranslateError::malformed(
                    format!("${} needs a field to aggregate", aggregate.jsonata_name()),
                    &acc.source,
                ));
            }
            None
        } else {
            Some(acc.item())
        };
        let alias = alias.map(str::to_string);

        if !acc.window.is_limited() {
            let arg = value.unwrap_or(Expression::Wildcard);
            let mut select = acc.to_select(vec![SelectItem::Expression {
                expr: aggregate.apply(arg),
                alias,
            }]);
            select.order_by.clear();
            return Ok(select);
        }

        // A window must be applied before aggregating.
        let inner_item = value.unwrap_or_else(|| Expression::Raw("1".into()));
        let inner = acc.to_select(vec![SelectItem::Expression {
            expr: inner_item,
            alias: Some("item".into()),
        }]);
        let sub = self.aliases.generate();
        let arg = if aggregate == Aggregate::Count {
            Expression::Wildcard
        } else {
            Expression::column(&sub, "item")
        };
        Ok(SelectQuery {
            projections: vec![SelectItem::Expression {
                expr: aggregate.apply(arg),
                alias,
            }],
            from: Some(TableRef::Subquery {
                query: Box::new(inner),
                alias: sub,
            }),
            ..Default::default()
        })
    }

    /// `(SELECT coalesce(json_agg(sN.item), '[]'::json) FROM (...) AS sN)`
    pub(crate) fn json_array_subquery(&mut self, acc: &PathAcc) -> Expression {
        let inner = acc.to_select(vec![SelectItem::Expression {
            expr: acc.item(),
            alias: Some("item".into()),
        }]);
        let sub = self.aliases.generate();
        let agg = Expression::function(
            "coalesce",
            vec![
                Expression::function("json_agg", vec![Expression::column(&sub, "item")]),
                Expression::Raw("'[]'::json".into()),
            ],
        );
        Expression::Subquery(Box::new(SelectQuery {
            projections: vec![SelectItem::Expression {
                expr: agg,
                alias: None,
            }],
            from: Some(TableRef::Subquery {
                query: Box::new(inner),
                alias: sub,
            }),
            ..Default::default()
        }))
    }

    /// `(SELECT <item> ... LIMIT 1)` for a to-one path that carries
    /// predicates and so cannot be a plain join.
    pub(crate) fn first_value_subquery(&self, acc: &PathAcc) -> Expression {
        let mut select = acc.to_select(vec![SelectItem::Expression {
            expr: acc.item(),
            alias: None,
        }]);
        let mut window = acc.window;
        window.narrow(0, 1);
        select.limit = window.limit;
        select.offset = window.offset();
        Expression::Subquery(Box::new(select))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::test_schema;
    use crate::sql::compile_expr;
    use crate::translate::expr::Params;

    #[test]
    fn test_resolve_relation_dedupes() {
        let schema = test_schema();
        let params = Params::new();
        let mut t = Translator::new(&schema, &params);
        let root = TableScope::new("pubs", t.aliases.generate());
        let first = t.resolve_relation(&root, "stage").unwrap();
        let second = t.resolve_relation(&root, "stage").unwrap();
        assert_eq!(first, second);
        assert_eq!(t.joins.len(), 1);
        assert_eq!(first.target_alias, "t1");
        assert_eq!(compile_expr(&first.on()), "t1.id = t0.\"stageId\"");
    }

    #[test]
    fn test_resolve_unknown_relation() {
        let schema = test_schema();
        let params = Params::new();
        let mut t = Translator::new(&schema, &params);
        let root = TableScope::new("pubs", "t0");
        let err = t.resolve_relation(&root, "author").unwrap_err();
        assert!(matches!(err, TranslateError::Schema(ref m) if m.contains("author")));
        assert!(t.joins.is_empty());
    }

    #[test]
    fn test_in_frame_isolates_joins() {
        let schema = test_schema();
        let params = Params::new();
        let mut t = Translator::new(&schema, &params);
        let root = TableScope::new("pubs", "t0");
        t.resolve_relation(&root, "stage").unwrap();
        let ((), inner) = t
            .in_frame(|t| {
                t.resolve_relation(&TableScope::new("pub_values", "t5"), "attrDef")?;
                Ok(())
            })
            .unwrap();
        assert_eq!(inner.len(), 1);
        assert_eq!(t.joins.len(), 1);
        assert!(t.joins.get("t0", "stage").is_some());
    }

    #[test]
    fn test_table_link_either_side() {
        let schema = test_schema();
        let params = Params::new();
        let t = Translator::new(&schema, &params);

        let (link, to_one) = t
            .table_link(&TableScope::new("pubs", "t0"), "stages", "t1")
            .unwrap();
        assert!(to_one);
        assert_eq!(compile_expr(&link), "t1.id = t0.\"stageId\"");

        let (link, to_one) = t
            .table_link(&TableScope::new("stages", "t0"), "pubs", "t1")
            .unwrap();
        assert!(!to_one);
        assert_eq!(compile_expr(&link), "t1.\"stageId\" = t0.id");
    }
}
