use tracing::debug;

use super::shorthand::Shorthand;
use super::DomainConfig;
use crate::error::{Result, TranslateError};
use crate::expr::{parse, BinaryOp, ExprNode, Step, UnaryNode, Value};
use crate::schema::Schema;
use crate::sql::{
    BinaryOperator, Expression, Join, JoinType, Literal, OrderByExpr, RenameAlias, SelectItem,
    SelectQuery, TableRef, UnaryOperator,
};
use crate::translate::expr::{compare, is_json_valued, json_literal, mirror};
use crate::translate::functions::{contains, to_jsonb, typed};
use crate::translate::path::{json_navigation, strip_context_step};
use crate::translate::{
    AliasGenerator, Context, Params, PathRole, TableScope, TranslationMode, TranslationResult,
    Translator,
};

/// Stands in for the root alias while attribute conditions are built,
/// before the root path is folded.
const ROOT_PLACEHOLDER: &str = "__root";

/// Prefix of every alias a filter introduces.
const ALIAS_PREFIX: &str = "f";

/// A filter compiled against the root table, ready to be spliced into a
/// statement the caller builds.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFilter {
    /// The expression after shorthand expansion.
    pub expanded_expression: String,
    /// Physical root table.
    pub table: String,
    alias: String,
    /// Aliases declared inside the filter (subqueries and joins).
    internal: Vec<String>,
    condition: Option<Expression>,
    joins: Vec<Join>,
    order_by: Vec<OrderByExpr>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl CompiledFilter {
    /// AND the filter onto `query`'s WHERE clause, with the root table of
    /// the filter bound to `root_alias` in the caller's statement. Joins the
    /// filter needs (sorting by a to-one relation, say) are added as well.
    pub fn apply(&self, query: &mut SelectQuery, root_alias: &str) {
        let renames = self.renames(root_alias);
        for join in &self.joins {
            let join = renames
                .iter()
                .fold(join.clone(), |join, rename| rename.rename_join(join));
            query.joins.push(join);
        }
        if let Some(condition) = &self.condition {
            query.and_where(relocate(&renames, condition.clone()));
        }
    }

    pub fn condition(&self, root_alias: &str) -> Option<Expression> {
        let renames = self.renames(root_alias);
        self.condition.clone().map(|c| relocate(&renames, c))
    }

    pub fn order_by(&self, root_alias: &str) -> Vec<OrderByExpr> {
        let renames = self.renames(root_alias);
        self.order_by
            .iter()
            .map(|o| OrderByExpr {
                expr: relocate(&renames, o.expr.clone()),
                asc: o.asc,
            })
            .collect()
    }

    /// Renames binding the filter root to `root_alias`. When the caller's
    /// alias is one the filter declares itself, the filter's own aliases
    /// move to `<root_alias>_<alias>` first so correlation stays with the
    /// caller's row.
    fn renames(&self, root_alias: &str) -> Vec<RenameAlias> {
        let mut renames = Vec::new();
        if self.internal.iter().any(|a| a == root_alias) {
            renames.extend(
                self.internal
                    .iter()
                    .map(|a| RenameAlias::new(a, format!("{}_{}", root_alias, a))),
            );
        }
        renames.push(RenameAlias::new(&self.alias, root_alias));
        renames
    }

    /// Whether applying the filter changes nothing.
    pub fn is_empty(&self) -> bool {
        self.condition.is_none() && self.joins.is_empty()
    }
}

fn relocate(renames: &[RenameAlias], expr: Expression) -> Expression {
    renames
        .iter()
        .fold(expr, |expr, rename| rename.rename_expr(expr))
}

/// Compile `expression` with the default publication configuration.
pub fn compile_filter(expression: &str, schema: &Schema, namespace: &str) -> Result<CompiledFilter> {
    DomainAdapter::new(schema, DomainConfig::default())?.compile_filter(expression, namespace)
}

pub struct DomainAdapter<'a> {
    schema: &'a Schema,
    config: DomainConfig,
    shorthand: Shorthand,
}

impl<'a> DomainAdapter<'a> {
    pub fn new(schema: &'a Schema, config: DomainConfig) -> Result<Self> {
        schema.table(&config.root_table)?;
        let shorthand = Shorthand::new(&config)?;
        Ok(DomainAdapter {
            schema,
            config,
            shorthand,
        })
    }

    pub fn config(&self) -> &DomainConfig {
        &self.config
    }

    pub fn expand(&self, expression: &str, namespace: &str) -> String {
        self.shorthand.expand(expression, namespace)
    }

    pub fn compile_filter(&self, expression: &str, namespace: &str) -> Result<CompiledFilter> {
        self.compile_filter_with(expression, namespace, &Params::new())
    }

    /// Accepts `$$root[...]` paths (with sorts and windows) or a bare
    /// predicate on the root table.
    pub fn compile_filter_with(
        &self,
        expression: &str,
        namespace: &str,
        params: &Params,
    ) -> Result<CompiledFilter> {
        let expanded = self.shorthand.expand(expression, namespace);
        let node = parse(&expanded)?;
        let steps = self.root_steps(&node)?;

        let mut translator =
            Translator::with_aliases(self.schema, params, AliasGenerator::new(ALIAS_PREFIX));
        let (steps, bound) = {
            let mut lift = Lift {
                adapter: self,
                translator: &mut translator,
                ctx: Context::for_table(&self.config.root_table, ROOT_PLACEHOLDER)
                    .with_mode(TranslationMode::Filter),
                bound: Vec::new(),
            };
            let steps = lift.steps(&steps)?;
            (steps, lift.bound)
        };
        let lifted_joins = translator.take_joins();

        let mut ctx = Context::root();
        for (name, condition) in bound {
            ctx.bind(name, TranslationResult::Expression(condition));
        }
        let acc = translator.fold_path(&steps, &ctx, PathRole::Statement)?;
        if !acc.projects_rows() {
            return Err(TranslateError::unsupported("projection in a filter", &node));
        }

        let to_root = RenameAlias::new(ROOT_PLACEHOLDER, &acc.root.alias);
        let condition = Expression::conjunction(
            acc.filters
                .iter()
                .map(|f| to_root.rename_expr(f.clone()))
                .collect(),
        );
        let joins = lifted_joins
            .to_joins()
            .into_iter()
            .chain(acc.joins.to_joins())
            .map(|join| Join {
                on: to_root.rename_expr(join.on.clone()),
                ..join
            })
            .collect();

        debug!(
            expression,
            expanded = %expanded,
            namespace,
            "Compiled filter"
        );
        Ok(CompiledFilter {
            expanded_expression: expanded,
            table: acc.physical_table.clone(),
            alias: acc.root.alias.clone(),
            internal: translator
                .aliases
                .issued()
                .into_iter()
                .filter(|a| *a != acc.root.alias)
                .collect(),
            condition,
            joins,
            order_by: acc.order_by.clone(),
            limit: acc.window.limit,
            offset: acc.window.offset(),
        })
    }

    fn root_steps(&self, node: &ExprNode) -> Result<Vec<Step>> {
        let root = &self.config.root_table;
        match node.path_table_root() {
            Some(table) if table == root => Ok(match node {
                ExprNode::Path(steps) => steps.clone(),
                other => vec![Step::new(other.clone())],
            }),
            Some(table) => Err(TranslateError::schema(format!(
                "filters apply to $${}, not $${}",
                root, table
            ))),
            None => Ok(vec![Step {
                node: ExprNode::Variable(format!("${}", root)),
                stages: vec![node.clone()],
            }]),
        }
    }
}

/// `attrs[attrDef.slug = '<slug>'].value[.more]`
struct AttributeRef {
    slug: String,
    /// Steps below the value field (JSON navigation).
    rest: Vec<Step>,
}

/// Replaces attribute conditions in predicate stages with bound variables
/// holding their EXISTS subqueries; the rest is left to the translator.
struct Lift<'s, 'a> {
    adapter: &'s DomainAdapter<'a>,
    translator: &'s mut Translator<'a>,
    ctx: Context,
    bound: Vec<(String, Expression)>,
}

impl Lift<'_, '_> {
    fn steps(&mut self, steps: &[Step]) -> Result<Vec<Step>> {
        steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                if i > 0 && !matches!(step.node, ExprNode::Sort(_)) {
                    return Ok(step.clone());
                }
                let stages = step
                    .stages
                    .iter()
                    .map(|stage| {
                        let window = stage.as_index().is_some()
                            || stage.as_bracketed_range().is_some()
                            || matches!(stage, ExprNode::Number(_));
                        if window {
                            Ok(stage.clone())
                        } else {
                            self.predicate(stage)
                        }
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Step {
                    node: step.node.clone(),
                    stages,
                })
            })
            .collect()
    }

    fn predicate(&mut self, node: &ExprNode) -> Result<ExprNode> {
        match node {
            ExprNode::Binary {
                op: op @ (BinaryOp::And | BinaryOp::Or),
                lhs,
                rhs,
            } => Ok(ExprNode::Binary {
                op: *op,
                lhs: Box::new(self.predicate(lhs)?),
                rhs: Box::new(self.predicate(rhs)?),
            }),
            ExprNode::Binary { op, lhs, rhs } if op.is_comparison() => {
                if let Some(attr) = self.attribute(lhs) {
                    let condition = self.comparison(&attr, *op, rhs, node)?;
                    return Ok(self.bind(condition));
                }
                if let Some(attr) = self.attribute(rhs) {
                    if *op == BinaryOp::In {
                        return Err(TranslateError::unsupported(
                            "attribute on the right of `in`",
                            node,
                        ));
                    }
                    let condition = self.comparison(&attr, mirror(*op), lhs, node)?;
                    return Ok(self.bind(condition));
                }
                self.check_fields(node)?;
                Ok(node.clone())
            }
            ExprNode::Function { name, args } if name == "not" && args.len() == 1 => {
                Ok(ExprNode::Function {
                    name: name.clone(),
                    args: vec![self.predicate(&args[0])?],
                })
            }
            ExprNode::Function { name, args } if name == "exists" && args.len() == 1 => {
                match self.attribute(&args[0]) {
                    Some(attr) => {
                        let condition = self.present(&attr)?;
                        Ok(self.bind(condition))
                    }
                    None => {
                        self.check_fields(node)?;
                        Ok(node.clone())
                    }
                }
            }
            ExprNode::Function { name, args } if name == "contains" && args.len() == 2 => {
                match self.attribute(&args[0]) {
                    Some(attr) => {
                        let condition = self.contains(&attr, &args[1])?;
                        Ok(self.bind(condition))
                    }
                    None => {
                        self.check_fields(node)?;
                        Ok(node.clone())
                    }
                }
            }
            ExprNode::Block(exprs) if exprs.len() == 1 => {
                Ok(ExprNode::Block(vec![self.predicate(&exprs[0])?]))
            }
            other => match self.attribute(other) {
                Some(attr) => {
                    let condition = self.present(&attr)?;
                    Ok(self.bind(condition))
                }
                None => {
                    self.check_fields(other)?;
                    Ok(other.clone())
                }
            },
        }
    }

    fn bind(&mut self, condition: Expression) -> ExprNode {
        let name = format!("attr#{}", self.bound.len());
        self.bound.push((name.clone(), condition));
        ExprNode::Variable(name)
    }

    fn attribute(&self, node: &ExprNode) -> Option<AttributeRef> {
        let config = &self.adapter.config;
        let ExprNode::Path(steps) = node else {
            return None;
        };
        let [first, value, rest @ ..] = strip_context_step(steps) else {
            return None;
        };
        let is_name = |step: &Step, expected: &str| {
            step.stages.is_empty() && matches!(&step.node, ExprNode::Name(n) if n == expected)
        };
        if !matches!(&first.node, ExprNode::Name(n) if *n == config.attributes)
            || first.stages.len() != 1
            || !is_name(value, config.value_field.as_str())
        {
            return None;
        }
        let ExprNode::Binary {
            op: BinaryOp::Eq,
            lhs,
            rhs,
        } = &first.stages[0]
        else {
            return None;
        };
        let (ExprNode::Path(key), ExprNode::String(slug)) = (lhs.as_ref(), rhs.as_ref()) else {
            return None;
        };
        match key.as_slice() {
            [def, field] if is_name(def, config.definition.as_str())
                && is_name(field, config.slug_field.as_str()) =>
            {
                Some(AttributeRef {
                    slug: slug.clone(),
                    rest: rest.to_vec(),
                })
            }
            _ => None,
        }
    }

    /// `EXISTS (SELECT 1 FROM values JOIN definitions ON ... WHERE <link>
    /// AND slug = ...)`, still open for a condition on the value, plus the
    /// value expression itself.
    fn attribute_select(&mut self, attr: &AttributeRef) -> Result<(SelectQuery, TranslationResult)> {
        let config = &self.adapter.config;
        let schema = self.translator.schema;
        let missing = |table: &str, what: &str| {
            TranslateError::schema(format!("table '{}' has no {}", table, what))
        };

        let root = schema.table(&config.root_table)?;
        let rel = root.relation(&config.attributes).ok_or_else(|| {
            missing(&config.root_table, &format!("relation '{}'", config.attributes))
        })?;
        let values = schema.table(&rel.target_table)?;
        let def_rel = values.relation(&config.definition).ok_or_else(|| {
            missing(&rel.target_table, &format!("relation '{}'", config.definition))
        })?;
        let definitions = schema.table(&def_rel.target_table)?;
        let (slug_column, _) = definitions.column(&config.slug_field).ok_or_else(|| {
            missing(&def_rel.target_table, &format!("field '{}'", config.slug_field))
        })?;
        let (value_column, value_type) = values.column(&config.value_field).ok_or_else(|| {
            missing(&rel.target_table, &format!("field '{}'", config.value_field))
        })?;

        let value_alias = self.translator.aliases.generate();
        let def_alias = self.translator.aliases.generate();
        let link = self.translator.relation_link(
            &TableScope::new(&config.root_table, ROOT_PLACEHOLDER),
            rel,
            &value_alias,
        )?;
        let on = self.translator.relation_link(
            &TableScope::new(&rel.target_table, &value_alias),
            def_rel,
            &def_alias,
        )?;

        let mut select = SelectQuery::from_table(&values.physical_name, &value_alias);
        select.projections = vec![SelectItem::Expression {
            expr: Expression::Raw("1".into()),
            alias: None,
        }];
        select.joins.push(Join {
            join_type: JoinType::Inner,
            table: TableRef::Table {
                name: definitions.physical_name.clone(),
                alias: Some(def_alias.clone()),
            },
            on,
        });
        select.and_where(link);
        select.and_where(Expression::binary(
            Expression::column(&def_alias, slug_column),
            BinaryOperator::Eq,
            Expression::string(&attr.slug),
        ));

        let column = Expression::column(&value_alias, &value_column);
        let value = if attr.rest.is_empty() {
            TranslationResult::reference(&value_alias, value_column, value_type)
        } else {
            let source = ExprNode::Path(attr.rest.clone()).to_string();
            TranslationResult::Expression(json_navigation(column, value_type, &attr.rest, &source)?)
        };
        Ok((select, value))
    }

    fn present(&mut self, attr: &AttributeRef) -> Result<Expression> {
        let (mut select, value) = self.attribute_select(attr)?;
        select.and_where(Expression::IsNull {
            expr: Box::new(value.into_expression()),
            negated: true,
        });
        Ok(Expression::Exists(Box::new(select)))
    }

    fn comparison(
        &mut self,
        attr: &AttributeRef,
        op: BinaryOp,
        other: &ExprNode,
        node: &ExprNode,
    ) -> Result<Expression> {
        if matches!(other, ExprNode::Value(Value::Null)) {
            return match op {
                BinaryOp::Eq => Ok(Expression::UnaryOp {
                    op: UnaryOperator::Not,
                    expr: Box::new(self.present(attr)?),
                }),
                BinaryOp::NotEq => self.present(attr),
                _ => Err(TranslateError::malformed("ordering against null", node)),
            };
        }

        let ctx = self.ctx.clone();
        let (mut select, value) = self.attribute_select(attr)?;
        let condition = if op == BinaryOp::In {
            let ExprNode::Unary(UnaryNode::Array(items)) = other else {
                return Err(TranslateError::unsupported(
                    "`in` against an attribute needs an array of literals",
                    node,
                ));
            };
            let mut list = Vec::with_capacity(items.len());
            for item in items {
                match self.translator.translate(item, &ctx)? {
                    TranslationResult::Literal(lit) => list.push(Expression::Literal(stored(lit))),
                    _ => {
                        return Err(TranslateError::unsupported(
                            "`in` against an attribute needs an array of literals",
                            node,
                        ))
                    }
                }
            }
            if list.is_empty() {
                return Ok(Expression::Literal(Literal::Boolean(false)));
            }
            Expression::InList {
                expr: Box::new(value.into_expression()),
                list,
                negated: false,
            }
        } else {
            match self.translator.translate(other, &ctx)? {
                right @ TranslationResult::Literal(_) => compare(op, value, right)?,
                // jsonb ordering keeps numbers numeric.
                right if is_json_valued(&value) => compare(
                    op,
                    value,
                    TranslationResult::Expression(to_jsonb(right)),
                )?,
                right => compare(op, value, right)?,
            }
        };
        select.and_where(condition);
        Ok(Expression::Exists(Box::new(select)))
    }

    fn contains(&mut self, attr: &AttributeRef, needle: &ExprNode) -> Result<Expression> {
        let ctx = self.ctx.clone();
        let needle = typed(self.translator.translate(needle, &ctx)?);
        let (mut select, value) = self.attribute_select(attr)?;
        select.and_where(contains(Expression::json_text(value.into_expression()), needle));
        Ok(Expression::Exists(Box::new(select)))
    }

    /// Reject root-table fields outside the filterable set.
    fn check_fields(&self, node: &ExprNode) -> Result<()> {
        let config = &self.adapter.config;
        let field = match node {
            ExprNode::Name(name) => Some(name),
            ExprNode::Path(steps) => match strip_context_step(steps).first().map(|s| &s.node) {
                Some(ExprNode::Name(name)) => Some(name),
                _ => None,
            },
            _ => None,
        };
        if let Some(name) = field {
            let root = self.adapter.schema.table(&config.root_table)?;
            if root.field(name).is_some() && !config.allows_field(name) {
                return Err(TranslateError::schema(format!(
                    "field '{}' of '{}' cannot be filtered on",
                    name, config.root_table
                )));
            }
            return Ok(());
        }
        match node {
            ExprNode::Binary { lhs, rhs, .. } => {
                self.check_fields(lhs)?;
                self.check_fields(rhs)
            }
            ExprNode::Unary(UnaryNode::Negate(inner)) => self.check_fields(inner),
            ExprNode::Unary(UnaryNode::Array(items)) | ExprNode::Block(items) => {
                items.iter().try_for_each(|item| self.check_fields(item))
            }
            ExprNode::Function { args, .. } => args.iter().try_for_each(|a| self.check_fields(a)),
            ExprNode::Condition {
                condition,
                then,
                otherwise,
            } => {
                self.check_fields(condition)?;
                self.check_fields(then)?;
                match otherwise {
                    Some(other) => self.check_fields(other),
                    None => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }
}

/// A literal as it is stored in a JSON attribute value.
fn stored(lit: Literal) -> Literal {
    match lit {
        Literal::Null => Literal::Json(serde_json::Value::Null),
        other => json_literal(other),
    }
}
