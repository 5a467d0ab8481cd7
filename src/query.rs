//! Query assembly and the public compile API.
//!
//! `compile` parses an expression, folds it into a statement and renders
//! the parameterized SQL once. The resulting [`CompiledQuery`] is immutable
//! and can be executed any number of times, concurrently, against any
//! [`Executor`].
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::db::{Executor, Row};
use crate::error::{Result, TranslateError};
use crate::expr::{parse, ExprNode, Step};
use crate::schema::Schema;
use crate::sql::{
    compile_parameterized, format_sql, Expression, Join, Literal, OrderByExpr, Rewriter,
    SelectItem, SelectQuery,
};
use crate::translate::functions::{check_supported, typed};
use crate::translate::{Aggregate, Context, Params, PathAcc, PathRole, Translator};

/// A statement taken apart for splicing into a query the caller owns.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryParts {
    /// Physical table of the root path; `None` for expressions that are not
    /// table paths.
    pub table: Option<String>,
    pub alias: Option<String>,
    /// WHERE conditions, to be AND-combined.
    pub filters: Vec<Expression>,
    pub order_by: Vec<OrderByExpr>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub projection: Vec<SelectItem>,
    pub joins: Vec<Join>,
}

impl QueryParts {
    fn from_path(acc: &PathAcc, projection: Vec<SelectItem>) -> Self {
        QueryParts {
            table: Some(acc.physical_table.clone()),
            alias: Some(acc.root.alias.clone()),
            filters: acc.conditions(),
            order_by: acc.order_by.clone(),
            limit: acc.window.limit,
            offset: acc.window.offset(),
            projection,
            joins: acc.joins.to_joins(),
        }
    }
}

/// Compiles expressions against one schema.
#[derive(Debug, Clone)]
pub struct Compiler {
    schema: Arc<Schema>,
}

impl Compiler {
    pub fn new(schema: Schema) -> Self {
        Compiler {
            schema: Arc::new(schema),
        }
    }

    pub fn from_shared(schema: Arc<Schema>) -> Self {
        Compiler { schema }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn compile(&self, expression: &str, params: &Params) -> Result<CompiledQuery> {
        let node = parse(expression)?;
        let (select, parts) = assemble(&self.schema, params, &node)?;
        let select = Rewriter::with_defaults().rewrite(select);
        let (sql, parameters) = compile_parameterized(&select);
        debug!(expression, sql = %sql, params = parameters.len(), "Compiled expression");
        Ok(CompiledQuery {
            expression: expression.to_string(),
            params: params.clone(),
            select,
            parts,
            sql,
            parameters,
            schema: Arc::clone(&self.schema),
        })
    }
}

/// Compile `expression` against `schema`.
pub fn compile(expression: &str, schema: &Schema, params: &Params) -> Result<CompiledQuery> {
    Compiler::new(schema.clone()).compile(expression, params)
}

#[derive(Debug, Clone)]
pub struct CompiledQuery {
    expression: String,
    params: Params,
    select: SelectQuery,
    parts: QueryParts,
    sql: String,
    parameters: Vec<Literal>,
    schema: Arc<Schema>,
}

impl CompiledQuery {
    /// Parameterized SQL (`$1`, `$2`, ...).
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Values for the SQL's placeholders, in order.
    pub fn parameters(&self) -> &[Literal] {
        &self.parameters
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn get_parts(&self) -> &QueryParts {
        &self.parts
    }

    /// The statement AST, for callers that want to extend it before
    /// rendering it themselves.
    pub fn to_builder(&self) -> SelectQuery {
        self.select.clone()
    }

    pub fn to_pretty_sql(&self) -> String {
        format_sql(&self.select)
    }

    /// Run the query. Runtime parameters are merged over the compile-time
    /// ones and the expression is recompiled with a fresh context.
    pub async fn execute<E>(
        &self,
        executor: &E,
        runtime_params: Option<&Params>,
    ) -> anyhow::Result<Vec<Row>>
    where
        E: Executor + ?Sized,
    {
        let start = Instant::now();
        let rows = match runtime_params {
            Some(extra) if !extra.is_empty() => {
                let mut merged = self.params.clone();
                merged.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
                let recompiled = Compiler::from_shared(Arc::clone(&self.schema))
                    .compile(&self.expression, &merged)?;
                executor
                    .query(&recompiled.sql, &recompiled.parameters)
                    .await?
            }
            _ => executor.query(&self.sql, &self.parameters).await?,
        };
        info!(
            rows = rows.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Executed compiled query"
        );
        Ok(rows)
    }
}

fn steps_of(node: &ExprNode) -> Vec<Step> {
    match node {
        ExprNode::Path(steps) => steps.clone(),
        other => vec![Step::new(other.clone())],
    }
}

/// Build the statement for a top-level expression.
fn assemble(
    schema: &Schema,
    params: &Params,
    node: &ExprNode,
) -> Result<(SelectQuery, QueryParts)> {
    let mut t = Translator::new(schema, params);
    let ctx = Context::root();

    if node.path_table_root().is_some() {
        let acc = t.fold_path(&steps_of(node), &ctx, PathRole::Statement)?;
        let items = acc.select_items();
        let select = acc.to_select(items.clone());
        return Ok((select, QueryParts::from_path(&acc, items)));
    }

    if let ExprNode::Function { name, args } = node {
        if let (Some(aggregate), [arg]) = (Aggregate::from_name(name), args.as_slice()) {
            if arg.path_table_root().is_some() {
                check_supported(name, node)?;
                let acc = t.fold_path(&steps_of(arg), &ctx, PathRole::Statement)?;
                let select = t.aggregate_statement(&acc, aggregate, Some("result"))?;
                let parts = QueryParts::from_path(&acc, select.projections.clone());
                return Ok((select, parts));
            }
        }
    }

    if let ExprNode::Sort(_) = node {
        return Err(TranslateError::malformed(
            "sort must follow a table path",
            node,
        ));
    }
    let value = typed(t.translate(node, &ctx)?);
    let projection = vec![SelectItem::Expression {
        expr: value,
        alias: Some("result".into()),
    }];
    let select = SelectQuery {
        projections: projection.clone(),
        ..Default::default()
    };
    let parts = QueryParts {
        projection,
        ..Default::default()
    };
    Ok((select, parts))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::schema::test_schema;
    use crate::sql::{check_sql, compile as compile_inline};

    fn sql(expression: &str) -> String {
        let compiled = compile(expression, &test_schema(), &Params::new()).unwrap();
        check_sql(compiled.sql()).unwrap();
        compiled.sql().to_string()
    }

    #[test]
    fn test_index_semantics() {
        assert_eq!(sql("$$pubs[0]"), "SELECT t0.* FROM pubs AS t0 LIMIT 1");
        assert_eq!(sql("$$pubs[2]"), "SELECT t0.* FROM pubs AS t0 LIMIT 1 OFFSET 2");
        assert_eq!(sql("$$pubs[[0..9]]"), "SELECT t0.* FROM pubs AS t0 LIMIT 10");
        assert_eq!(
            sql("$$pubs[[2..5]]"),
            "SELECT t0.* FROM pubs AS t0 LIMIT 4 OFFSET 2"
        );
    }

    #[test]
    fn test_sort_then_limit() {
        assert_eq!(
            sql("$$pubs^(>createdAt)[[0..4]]"),
            "SELECT t0.* FROM pubs AS t0 ORDER BY t0.\"createdAt\" DESC LIMIT 5"
        );
    }

    #[test]
    fn test_relation_filter_is_exists() {
        let compiled = compile(
            "$$pubs[stage.name = 'Stage 1']",
            &test_schema(),
            &Params::new(),
        )
        .unwrap();
        assert_eq!(
            compiled.sql(),
            "SELECT t0.* FROM pubs AS t0 WHERE EXISTS (SELECT 1 FROM stages AS t1 \
             WHERE t1.id = t0.\"stageId\" AND t1.name = $1)"
        );
        assert_eq!(compiled.parameters(), &[Literal::String("Stage 1".into())]);
        assert!(compiled.get_parts().joins.is_empty());
    }

    #[test]
    fn test_plain_filter_has_no_join() {
        let compiled = compile(
            "$$pubs[title = 'Some title']",
            &test_schema(),
            &Params::new(),
        )
        .unwrap();
        assert_eq!(
            compiled.sql(),
            "SELECT t0.* FROM pubs AS t0 WHERE t0.title = $1"
        );
        assert!(!compiled.sql().contains("JOIN"));
        assert!(!compiled.sql().contains("EXISTS"));
    }

    #[test]
    fn test_projection_joins_once() {
        let s = sql("$$pubs.{\"name\": stage.name, \"order\": stage.order, \"title\": title}");
        assert_eq!(s.matches("LEFT JOIN").count(), 1);
        assert!(s.contains("t0.title AS title"), "{}", s);
    }

    #[test]
    fn test_nested_table_in_projection_is_json_array() {
        let s = sql("$$stages.{\"name\": name, \"pubs\": $$pubs.title}");
        assert!(s.contains("json_agg"), "{}", s);
        assert!(s.contains("WHERE t1.\"stageId\" = t0.id"), "{}", s);
    }

    #[test]
    fn test_top_level_aggregate() {
        let compiled = compile(
            "$count($$pubs[score > 3])",
            &test_schema(),
            &Params::new(),
        )
        .unwrap();
        assert_eq!(
            compiled.sql(),
            "SELECT count(*) AS result FROM pubs AS t0 WHERE t0.score > $1"
        );
        assert_eq!(compiled.parameters(), &[Literal::Integer(3)]);

        let s = sql("$sum($$pubs[[0..9]].score)");
        assert!(s.starts_with("SELECT coalesce(sum(t1.item), 0) AS result FROM (SELECT"), "{}", s);
        assert!(s.contains("LIMIT 10) AS t1"), "{}", s);
    }

    #[test]
    fn test_aggregate_over_relation_is_scalar_subquery() {
        let s = sql("$$stages.{\"n\": $count($$pubs)}");
        assert!(
            s.contains("(SELECT count(*) FROM pubs AS t1 WHERE t1.\"stageId\" = t0.id)"),
            "{}",
            s
        );
    }

    #[test]
    fn test_non_path_expression() {
        let compiled = compile("'a' & 'b'", &test_schema(), &Params::new()).unwrap();
        assert_eq!(compiled.sql(), "SELECT $1::text AS result");
        assert_eq!(compiled.parameters(), &[Literal::String("ab".into())]);
    }

    #[test]
    fn test_parts_and_builder() {
        let compiled = compile(
            "$$pubs[score > 1]^(title)[[0..9]]",
            &test_schema(),
            &Params::new(),
        )
        .unwrap();
        let parts = compiled.get_parts();
        assert_eq!(parts.table.as_deref(), Some("pubs"));
        assert_eq!(parts.alias.as_deref(), Some("t0"));
        assert_eq!(parts.filters.len(), 1);
        assert_eq!(parts.order_by.len(), 1);
        assert_eq!(parts.limit, Some(10));
        assert_eq!(parts.offset, None);

        let mut builder = compiled.to_builder();
        builder.limit = Some(1);
        assert!(compile_inline(&builder).ends_with("LIMIT 1"));
        assert!(compiled.sql().ends_with("LIMIT 10"));
    }

    #[test]
    fn test_fail_fast() {
        let schema = test_schema();
        for input in ["$$nope", "$$pubs[nope.name = 1]", "$$pubs[$eval('1')]"] {
            assert!(compile(input, &schema, &Params::new()).is_err(), "{}", input);
        }
    }

    struct Recording {
        calls: Mutex<Vec<(String, Vec<Literal>)>>,
    }

    #[async_trait]
    impl Executor for Recording {
        async fn query(&self, sql: &str, params: &[Literal]) -> anyhow::Result<Vec<Row>> {
            self.calls
                .lock()
                .unwrap()
                .push((sql.to_string(), params.to_vec()));
            Ok(vec![Row::new()])
        }
    }

    #[tokio::test]
    async fn test_execute_with_runtime_params() {
        let mut params = Params::new();
        params.insert("min".into(), serde_json::json!(1));
        let compiled = compile("$$pubs[score > $min]", &test_schema(), &params).unwrap();
        let executor = Recording {
            calls: Mutex::new(Vec::new()),
        };

        let rows = compiled.execute(&executor, None).await.unwrap();
        assert_eq!(rows.len(), 1);

        let mut runtime = Params::new();
        runtime.insert("min".into(), serde_json::json!(5));
        compiled.execute(&executor, Some(&runtime)).await.unwrap();

        let calls = executor.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, calls[1].0);
        assert_eq!(calls[0].1, vec![Literal::Integer(1)]);
        assert_eq!(calls[1].1, vec![Literal::Integer(5)]);
    }
}
