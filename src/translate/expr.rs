//! Expression translator.
//!
//! One recursive dispatch over [`ExprNode`]. Every node kind either has a
//! rule here (or in `path`/`functions`) or fails with a typed error; there
//! is no fallback that emits SQL for something it does not understand.
use serde_json::Value as JsonValue;
use tracing::trace;

use super::context::{AliasGenerator, Context, TranslationMode};
use super::functions::typed;
use super::joins::JoinSet;
use super::path::{json_navigation, row_json, strip_context_step, PathRole, Projection};
use super::result::TranslationResult;
use crate::error::{Result, TranslateError};
use crate::expr::{BinaryOp, ExprNode, Step, UnaryNode, Value};
use crate::schema::{FieldType, Schema};
use crate::sql::{BinaryOperator, Expression, Literal, UnaryOperator};

/// Named values available to `$name` references.
pub type Params = serde_json::Map<String, JsonValue>;

/// Largest integer a JSON number holds exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Upper bound on the elements a literal `[a..b]` may expand to.
const MAX_RANGE_ELEMENTS: i64 = 10_000;

pub struct Translator<'a> {
    pub(crate) schema: &'a Schema,
    pub(crate) params: &'a Params,
    pub(crate) aliases: AliasGenerator,
    /// LEFT JOINs pending for the statement currently being built.
    pub(crate) joins: JoinSet,
}

impl<'a> Translator<'a> {
    pub fn new(schema: &'a Schema, params: &'a Params) -> Self {
        Self::with_aliases(schema, params, AliasGenerator::default())
    }

    /// Translator issuing aliases from `aliases`, for fragments that are
    /// spliced into statements built elsewhere.
    pub fn with_aliases(schema: &'a Schema, params: &'a Params, aliases: AliasGenerator) -> Self {
        Translator {
            schema,
            params,
            aliases,
            joins: JoinSet::default(),
        }
    }

    /// Joins registered outside any path frame.
    pub fn take_joins(&mut self) -> JoinSet {
        std::mem::take(&mut self.joins)
    }

    pub fn translate(&mut self, node: &ExprNode, ctx: &Context) -> Result<TranslationResult> {
        match node {
            ExprNode::String(s) => Ok(TranslationResult::Literal(Literal::String(s.clone()))),
            ExprNode::Number(n) => Ok(TranslationResult::Literal(number_literal(*n))),
            ExprNode::Value(Value::Bool(b)) => Ok(TranslationResult::Literal(Literal::Boolean(*b))),
            ExprNode::Value(Value::Null) => Ok(TranslationResult::Literal(Literal::Null)),
            ExprNode::Name(_) => self.path(&[Step::new(node.clone())], ctx),
            ExprNode::Variable(name) => match node.table_root() {
                Some(_) => self.path(&[Step::new(node.clone())], ctx),
                None => self.variable(name, node, ctx),
            },
            ExprNode::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs, node, ctx),
            ExprNode::Unary(UnaryNode::Negate(inner)) => {
                Ok(match self.translate(inner, ctx)? {
                    TranslationResult::Literal(Literal::Integer(i)) => {
                        TranslationResult::Literal(Literal::Integer(-i))
                    }
                    TranslationResult::Literal(Literal::Float(f)) => {
                        TranslationResult::Literal(Literal::Float(-f))
                    }
                    other => TranslationResult::Expression(Expression::UnaryOp {
                        op: UnaryOperator::Minus,
                        expr: Box::new(other.into_expression()),
                    }),
                })
            }
            ExprNode::Unary(UnaryNode::Object(pairs)) => {
                let values = self.object_values(pairs, ctx)?;
                Ok(TranslationResult::Expression(super::path::json_object(
                    &values,
                )))
            }
            ExprNode::Unary(UnaryNode::Array(items)) => {
                let items = self
                    .array_items(items, ctx)?
                    .into_iter()
                    .map(typed)
                    .collect();
                Ok(TranslationResult::Expression(Expression::Array(items)))
            }
            ExprNode::Path(steps) => self.path(steps, ctx),
            ExprNode::Function { name, args } => self.function_call(name, args, node, ctx),
            ExprNode::Condition {
                condition,
                then,
                otherwise,
            } => {
                let when = self.condition(condition, ctx)?;
                let then = self.expression(then, ctx)?;
                let else_clause = match otherwise {
                    Some(other) => Some(Box::new(self.expression(other, ctx)?)),
                    None => None,
                };
                Ok(TranslationResult::Expression(Expression::Case {
                    when_clauses: vec![(when, then)],
                    else_clause,
                }))
            }
            ExprNode::Block(exprs) => {
                let mut local = ctx.clone();
                let mut last = TranslationResult::Literal(Literal::Null);
                for expr in exprs {
                    last = match expr {
                        ExprNode::Bind { name, value } => {
                            let value = self.translate(value, &local)?;
                            local.bind(name.clone(), value.clone());
                            value
                        }
                        other => self.translate(other, &local)?,
                    };
                }
                Ok(last)
            }
            ExprNode::Bind { value, .. } => self.translate(value, ctx),
            ExprNode::Sort(_) => Err(TranslateError::malformed(
                "sort must follow a table or relation step",
                node,
            )),
        }
    }

    pub fn expression(&mut self, node: &ExprNode, ctx: &Context) -> Result<Expression> {
        self.translate(node, ctx).map(TranslationResult::into_expression)
    }

    /// Translate `node` as a boolean condition.
    ///
    /// A relation or table path used as a condition is true when it yields
    /// at least one non-null value; a non-boolean field is true when it is
    /// not null.
    pub fn condition(&mut self, node: &ExprNode, ctx: &Context) -> Result<Expression> {
        let ctx = ctx.with_mode(TranslationMode::Filter);
        if let Some(steps) = self.navigation(node, &ctx) {
            let acc = self.fold_path(&steps, &ctx, PathRole::Nested)?;
            let condition = (!acc.projects_rows()).then(|| Expression::IsNull {
                expr: Box::new(acc.item()),
                negated: true,
            });
            return Ok(self.exists_subquery(&acc, condition));
        }
        Ok(match self.translate(node, &ctx)? {
            TranslationResult::Literal(lit) => Expression::Literal(Literal::Boolean(truthy(&lit))),
            TranslationResult::Reference {
                column,
                table_alias,
                field_type: FieldType::Boolean,
            } => Expression::column(table_alias, column),
            TranslationResult::Reference {
                column,
                table_alias,
                ..
            } => Expression::IsNull {
                expr: Box::new(Expression::column(table_alias, column)),
                negated: true,
            },
            other => other.into_expression(),
        })
    }

    fn variable(&mut self, name: &str, node: &ExprNode, ctx: &Context) -> Result<TranslationResult> {
        if name.is_empty() {
            let scope = ctx.scope("$")?;
            return Ok(TranslationResult::Expression(row_json(&scope.alias)));
        }
        if let Some(bound) = ctx.binding(name) {
            return Ok(bound.clone());
        }
        match self.params.get(name) {
            Some(value) => Ok(json_result(value)),
            None => Err(TranslateError::malformed(
                format!("unbound variable ${}", name),
                node,
            )),
        }
    }

    /// Paths that are not table or relation navigation: fields, JSON
    /// descent into a field, and descent into a bound JSON value.
    fn path(&mut self, steps: &[Step], ctx: &Context) -> Result<TranslationResult> {
        let steps = strip_context_step(steps);
        let source = ExprNode::Path(steps.to_vec());
        let Some(first) = steps.first() else {
            return Err(TranslateError::malformed("empty path", &source));
        };

        if let Some(nav) = self.navigation(&source, ctx) {
            return self.navigate(&nav, &source, ctx);
        }

        match &first.node {
            ExprNode::Name(name) => {
                if !first.stages.is_empty() {
                    return Err(TranslateError::unsupported(
                        "predicate on a field step (apply it to the table step)",
                        &source,
                    ));
                }
                let scope = ctx.scope(name)?;
                let table = self.schema.table(&scope.table)?;
                let (column, field_type) = table.column(name).ok_or_else(|| {
                    TranslateError::schema(format!(
                        "table '{}' has no field or relation '{}'",
                        scope.table, name
                    ))
                })?;
                if steps.len() == 1 {
                    return Ok(TranslationResult::reference(&scope.alias, column, field_type));
                }
                let base = Expression::column(&scope.alias, column);
                let expr = json_navigation(base, field_type, &steps[1..], &source.to_string())?;
                Ok(TranslationResult::Expression(expr))
            }
            ExprNode::Variable(name) if first.stages.is_empty() => {
                let value = self.variable(name, &first.node, ctx)?;
                if steps.len() == 1 {
                    return Ok(value);
                }
                let rest = &steps[1..];
                match value {
                    TranslationResult::Literal(Literal::Json(json)) => {
                        static_descent(&json, rest, &source)
                    }
                    TranslationResult::Reference {
                        column,
                        table_alias,
                        field_type,
                    } => {
                        let base = Expression::column(table_alias, column);
                        let expr = json_navigation(base, field_type, rest, &source.to_string())?;
                        Ok(TranslationResult::Expression(expr))
                    }
                    other => {
                        let base = other.into_expression();
                        let expr =
                            json_navigation(base, FieldType::Json, rest, &source.to_string())?;
                        Ok(TranslationResult::Expression(expr))
                    }
                }
            }
            ExprNode::Path(inner) if steps.len() == 1 && first.stages.is_empty() => {
                self.path(inner, ctx)
            }
            other if steps.len() == 1 && first.stages.is_empty() => self.translate(other, ctx),
            other => Err(TranslateError::unsupported(
                format!("path starting at `{}`", other),
                &source,
            )),
        }
    }

    /// A relation or `$$table` path used as a value.
    fn navigate(
        &mut self,
        steps: &[Step],
        source: &ExprNode,
        ctx: &Context,
    ) -> Result<TranslationResult> {
        if let Some(joined) = self.try_joined_path(steps, ctx)? {
            return Ok(joined);
        }
        let acc = self.fold_path(steps, ctx, PathRole::Nested)?;
        if acc.to_many {
            if !ctx.mode.allows_collections() {
                return Err(TranslateError::unsupported(
                    format!(
                        "collection-valued path in {} position",
                        mode_name(ctx.mode)
                    ),
                    source,
                ));
            }
            trace!(path = %acc.source, "Collecting path into a JSON array");
            return Ok(TranslationResult::Expression(self.json_array_subquery(&acc)));
        }
        Ok(TranslationResult::Expression(self.first_value_subquery(&acc)))
    }

    /// Resolve a relation path through LEFT JOINs when every step is a
    /// plain to-one relation and the path ends in a field or relation.
    ///
    /// Returns `None` without registering anything when the path does not
    /// qualify.
    pub(crate) fn try_joined_path(
        &mut self,
        steps: &[Step],
        ctx: &Context,
    ) -> Result<Option<TranslationResult>> {
        let Some(scope) = ctx.current.as_ref() else {
            return Ok(None);
        };
        if steps.iter().any(|s| !s.stages.is_empty()) {
            return Ok(None);
        }

        // Dry walk over the schema first.
        let mut table = self.schema.table(&scope.table)?;
        let mut relations = Vec::new();
        let mut field = None;
        for (i, step) in steps.iter().enumerate() {
            let ExprNode::Name(name) = &step.node else {
                return Ok(None);
            };
            if let Some(rel) = table.relation(name) {
                if !rel.to_one {
                    return Ok(None);
                }
                relations.push(name.as_str());
                table = self.schema.table(&rel.target_table)?;
            } else if let Some((column, field_type)) = table.column(name) {
                if relations.is_empty() {
                    return Ok(None);
                }
                field = Some((column, field_type, i));
                break;
            } else {
                return Err(TranslateError::schema(format!(
                    "table '{}' has no field or relation '{}'",
                    table.name, name
                )));
            }
        }
        if relations.is_empty() {
            return Ok(None);
        }
        if let Some((_, field_type, i)) = &field {
            let rest = &steps[i + 1..];
            if !rest.is_empty() && *field_type != FieldType::Json {
                return Ok(None);
            }
        }

        let mut current = scope.clone();
        for relation in relations {
            current = self.resolve_relation(&current, relation)?.target_scope();
        }
        Ok(Some(match field {
            Some((column, field_type, i)) if i + 1 == steps.len() => {
                TranslationResult::reference(&current.alias, column, field_type)
            }
            Some((column, field_type, i)) => {
                let source = ExprNode::Path(steps.to_vec()).to_string();
                let base = Expression::column(&current.alias, column);
                TranslationResult::Expression(json_navigation(
                    base,
                    field_type,
                    &steps[i + 1..],
                    &source,
                )?)
            }
            None => TranslationResult::Expression(row_json(&current.alias)),
        }))
    }

    fn binary(
        &mut self,
        op: BinaryOp,
        lhs: &ExprNode,
        rhs: &ExprNode,
        node: &ExprNode,
        ctx: &Context,
    ) -> Result<TranslationResult> {
        match op {
            BinaryOp::Range => {
                return Err(TranslateError::malformed(
                    "range is only valid inside [ ]",
                    node,
                ))
            }
            BinaryOp::And | BinaryOp::Or => {
                let left = self.condition(lhs, ctx)?;
                let right = self.condition(rhs, ctx)?;
                let op = if op == BinaryOp::And {
                    BinaryOperator::And
                } else {
                    BinaryOperator::Or
                };
                return Ok(TranslationResult::Expression(Expression::binary(
                    left, op, right,
                )));
            }
            _ => {}
        }

        if op.is_comparison() && ctx.mode.is_filter() {
            if let Some(steps) = self.navigation(lhs, ctx) {
                return self.exists_comparison(&steps, op, rhs, node, ctx);
            }
            if op != BinaryOp::In {
                if let Some(steps) = self.navigation(rhs, ctx) {
                    return self.exists_comparison(&steps, mirror(op), lhs, node, ctx);
                }
            }
        }

        if op == BinaryOp::In {
            let left = self.translate(lhs, ctx)?;
            return self.membership(left, rhs, node, ctx);
        }

        let left = self.translate(lhs, ctx)?;
        let right = self.translate(rhs, ctx)?;
        if op.is_comparison() {
            return compare(op, left, right).map(TranslationResult::Expression);
        }
        arithmetic(op, left, right)
    }

    /// `EXISTS (SELECT 1 FROM <path> WHERE <value> <op> <other>)`: a
    /// comparison holds when any value the path yields satisfies it.
    fn exists_comparison(
        &mut self,
        steps: &[Step],
        op: BinaryOp,
        other: &ExprNode,
        node: &ExprNode,
        ctx: &Context,
    ) -> Result<TranslationResult> {
        let acc = self.fold_path(steps, ctx, PathRole::Nested)?;
        if acc.projects_rows() {
            return Err(TranslateError::malformed(
                "a relation compares by its fields, not as a whole row",
                node,
            ));
        }
        let value = match &acc.projection {
            Projection::Column {
                expr: Expression::Column { table: Some(t), name },
                field_type,
                ..
            } => TranslationResult::reference(t, name, *field_type),
            _ => TranslationResult::Expression(acc.item()),
        };
        let condition = match op {
            BinaryOp::In => match self.membership(value, other, node, ctx)? {
                TranslationResult::Expression(e) => e,
                other => other.into_expression(),
            },
            _ => {
                let other = self.translate(other, ctx)?;
                compare(op, value, other)?
            }
        };
        Ok(TranslationResult::Expression(
            self.exists_subquery(&acc, Some(condition)),
        ))
    }

    /// `value in rhs`: an IN list for an array constructor, equality for a
    /// scalar, `= ANY(...)` for anything array-valued.
    fn membership(
        &mut self,
        value: TranslationResult,
        rhs: &ExprNode,
        node: &ExprNode,
        ctx: &Context,
    ) -> Result<TranslationResult> {
        let json_side = is_json_valued(&value);
        let list = match rhs {
            ExprNode::Unary(UnaryNode::Array(items)) => self.array_items(items, ctx)?,
            other => match self.translate(other, ctx)? {
                TranslationResult::Expression(Expression::Array(items)) => items
                    .into_iter()
                    .map(TranslationResult::Expression)
                    .collect(),
                lit @ TranslationResult::Literal(_) => {
                    return compare(BinaryOp::Eq, value, lit).map(TranslationResult::Expression)
                }
                collection => {
                    return Ok(TranslationResult::Expression(Expression::binary(
                        value.into_expression(),
                        BinaryOperator::Eq,
                        Expression::function("ANY", vec![collection.into_expression()]),
                    )))
                }
            },
        };
        if list.is_empty() {
            trace!(node = %node, "Empty IN list");
            return Ok(TranslationResult::Literal(Literal::Boolean(false)));
        }
        let list = list
            .into_iter()
            .map(|item| match item {
                TranslationResult::Literal(lit) if json_side => {
                    Expression::Literal(json_literal(lit))
                }
                other => other.into_expression(),
            })
            .collect();
        Ok(TranslationResult::Expression(Expression::InList {
            expr: Box::new(value.into_expression()),
            list,
            negated: false,
        }))
    }

    /// Elements of an array constructor, with literal integer ranges
    /// expanded in place.
    fn array_items(&mut self, items: &[ExprNode], ctx: &Context) -> Result<Vec<TranslationResult>> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            if let ExprNode::Binary {
                op: BinaryOp::Range,
                lhs,
                rhs,
            } = item
            {
                let (start, end) = match (lhs.as_index(), rhs.as_index()) {
                    (Some(s), Some(e)) => (s, e),
                    _ => {
                        return Err(TranslateError::unsupported(
                            "range with non-literal bounds",
                            item,
                        ))
                    }
                };
                if end.saturating_sub(start) >= MAX_RANGE_ELEMENTS {
                    return Err(TranslateError::malformed("range too large", item));
                }
                out.extend(
                    (start..=end).map(|i| TranslationResult::Literal(Literal::Integer(i))),
                );
                continue;
            }
            out.push(self.translate(item, ctx)?);
        }
        Ok(out)
    }
}

fn mode_name(mode: TranslationMode) -> &'static str {
    match mode {
        TranslationMode::Root => "root",
        TranslationMode::Filter => "filter",
        TranslationMode::Projection => "projection",
        TranslationMode::Order => "sort",
        TranslationMode::Subquery => "subquery",
    }
}

/// Integral numbers within the exact range become integers.
fn number_literal(n: f64) -> Literal {
    if n.fract() == 0.0 && n.abs() < MAX_SAFE_INTEGER {
        Literal::Integer(n as i64)
    } else {
        Literal::Float(n)
    }
}

fn json_result(value: &JsonValue) -> TranslationResult {
    match value {
        JsonValue::Array(items) if items.iter().all(is_scalar) => TranslationResult::Expression(
            Expression::Array(
                items
                    .iter()
                    .map(|v| typed(TranslationResult::Literal(scalar_literal(v))))
                    .collect(),
            ),
        ),
        JsonValue::Array(_) | JsonValue::Object(_) => {
            TranslationResult::Literal(Literal::Json(value.clone()))
        }
        scalar => TranslationResult::Literal(scalar_literal(scalar)),
    }
}

fn is_scalar(value: &JsonValue) -> bool {
    !matches!(value, JsonValue::Array(_) | JsonValue::Object(_))
}

fn scalar_literal(value: &JsonValue) -> Literal {
    match value {
        JsonValue::Null => Literal::Null,
        JsonValue::Bool(b) => Literal::Boolean(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Literal::Integer(i),
            None => Literal::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        JsonValue::String(s) => Literal::String(s.clone()),
        other => Literal::Json(other.clone()),
    }
}

/// `$param.a.b` against a JSON parameter, resolved at compile time. A
/// missing key yields null.
fn static_descent(json: &JsonValue, steps: &[Step], source: &ExprNode) -> Result<TranslationResult> {
    let mut current = json;
    for step in steps {
        match (&step.node, step.stages.is_empty()) {
            (ExprNode::Name(key), true) => match current.get(key) {
                Some(next) => current = next,
                None => return Ok(TranslationResult::Literal(Literal::Null)),
            },
            (other, _) => {
                return Err(TranslateError::unsupported(
                    format!("navigation through `{}` in a parameter", other),
                    source,
                ))
            }
        }
    }
    Ok(json_result(current))
}

fn truthy(lit: &Literal) -> bool {
    match lit {
        Literal::Null => false,
        Literal::Boolean(b) => *b,
        Literal::Integer(i) => *i != 0,
        Literal::Float(f) => *f != 0.0,
        Literal::String(s) => !s.is_empty(),
        Literal::Json(v) => match v {
            JsonValue::Array(a) => !a.is_empty(),
            JsonValue::Object(o) => !o.is_empty(),
            _ => true,
        },
    }
}

pub(crate) fn is_json_valued(result: &TranslationResult) -> bool {
    match result {
        TranslationResult::Reference { field_type, .. } => *field_type == FieldType::Json,
        TranslationResult::Expression(Expression::JsonAccess { as_text, .. }) => !as_text,
        _ => false,
    }
}

/// A literal re-encoded for comparison with a `jsonb` value.
pub(crate) fn json_literal(lit: Literal) -> Literal {
    match lit {
        Literal::Boolean(b) => Literal::Json(JsonValue::Bool(b)),
        Literal::Integer(i) => Literal::Json(JsonValue::from(i)),
        Literal::Float(f) => Literal::Json(JsonValue::from(f)),
        Literal::String(s) => Literal::Json(JsonValue::String(s)),
        other => other,
    }
}

pub(crate) fn mirror(op: BinaryOp) -> BinaryOp {
    match op {
        BinaryOp::Lt => BinaryOp::Gt,
        BinaryOp::LtEq => BinaryOp::GtEq,
        BinaryOp::Gt => BinaryOp::Lt,
        BinaryOp::GtEq => BinaryOp::LtEq,
        other => other,
    }
}

pub(crate) fn sql_operator(op: BinaryOp) -> Option<BinaryOperator> {
    Some(match op {
        BinaryOp::Eq => BinaryOperator::Eq,
        BinaryOp::NotEq => BinaryOperator::NotEq,
        BinaryOp::Lt => BinaryOperator::Lt,
        BinaryOp::LtEq => BinaryOperator::LtEq,
        BinaryOp::Gt => BinaryOperator::Gt,
        BinaryOp::GtEq => BinaryOperator::GtEq,
        BinaryOp::Plus => BinaryOperator::Plus,
        BinaryOp::Minus => BinaryOperator::Minus,
        BinaryOp::Multiply => BinaryOperator::Multiply,
        BinaryOp::Divide => BinaryOperator::Divide,
        BinaryOp::Modulo => BinaryOperator::Modulo,
        BinaryOp::And => BinaryOperator::And,
        BinaryOp::Or => BinaryOperator::Or,
        BinaryOp::Concat => BinaryOperator::Concat,
        BinaryOp::In | BinaryOp::Range => return None,
    })
}

/// Comparison with null handling and JSON alignment of literals.
pub(crate) fn compare(op: BinaryOp, left: TranslationResult, right: TranslationResult) -> Result<Expression> {
    let sql_op = sql_operator(op)
        .ok_or_else(|| TranslateError::malformed("not a comparison", op.symbol()))?;
    if matches!(op, BinaryOp::Eq | BinaryOp::NotEq) {
        let negated = op == BinaryOp::NotEq;
        if right.is_null() {
            return Ok(Expression::IsNull {
                expr: Box::new(left.into_expression()),
                negated,
            });
        }
        if left.is_null() {
            return Ok(Expression::IsNull {
                expr: Box::new(right.into_expression()),
                negated,
            });
        }
    }
    let (left, right) = align(left, right);
    Ok(Expression::binary(
        left.into_expression(),
        sql_op,
        right.into_expression(),
    ))
}

fn align(left: TranslationResult, right: TranslationResult) -> (TranslationResult, TranslationResult) {
    match (&left, &right) {
        (l, TranslationResult::Literal(lit)) if is_json_valued(l) => {
            let lit = json_literal(lit.clone());
            (left, TranslationResult::Literal(lit))
        }
        (TranslationResult::Literal(lit), r) if is_json_valued(r) => {
            let lit = json_literal(lit.clone());
            (TranslationResult::Literal(lit), right)
        }
        _ => (left, right),
    }
}

/// Arithmetic and `&`; two literal numbers fold to a literal.
fn arithmetic(
    op: BinaryOp,
    left: TranslationResult,
    right: TranslationResult,
) -> Result<TranslationResult> {
    if let (Some(l), Some(r)) = (left.as_literal(), right.as_literal()) {
        if let Some(folded) = fold_constants(op, l, r) {
            return Ok(TranslationResult::Literal(folded));
        }
    }
    let expr = match op {
        BinaryOp::Concat => Expression::binary(
            text_operand(left),
            BinaryOperator::Concat,
            text_operand(right),
        ),
        _ => {
            let sql_op = sql_operator(op).ok_or_else(|| {
                TranslateError::malformed("not an arithmetic operator", op.symbol())
            })?;
            Expression::binary(left.into_expression(), sql_op, right.into_expression())
        }
    };
    Ok(TranslationResult::Expression(expr))
}

fn text_operand(value: TranslationResult) -> Expression {
    match value {
        TranslationResult::Reference {
            field_type: FieldType::Text,
            ..
        } => value.into_expression(),
        other => Expression::TypeCast {
            expr: Box::new(other.into_expression()),
            data_type: "text".into(),
        },
    }
}

fn fold_constants(op: BinaryOp, left: &Literal, right: &Literal) -> Option<Literal> {
    use Literal::{Float, Integer, String as Str};
    match (op, left, right) {
        (BinaryOp::Concat, Str(a), Str(b)) => Some(Str(format!("{}{}", a, b))),
        (BinaryOp::Plus, Integer(a), Integer(b)) => a.checked_add(*b).map(Integer),
        (BinaryOp::Minus, Integer(a), Integer(b)) => a.checked_sub(*b).map(Integer),
        (BinaryOp::Multiply, Integer(a), Integer(b)) => a.checked_mul(*b).map(Integer),
        (BinaryOp::Modulo, Integer(a), Integer(b)) if *b != 0 => Some(Integer(a % b)),
        (_, Integer(_) | Float(_), Integer(_) | Float(_)) => {
            let a = as_f64(left)?;
            let b = as_f64(right)?;
            let value = match op {
                BinaryOp::Plus => a + b,
                BinaryOp::Minus => a - b,
                BinaryOp::Multiply => a * b,
                BinaryOp::Divide if b != 0.0 => a / b,
                BinaryOp::Modulo if b != 0.0 => a % b,
                _ => return None,
            };
            Some(number_literal(value))
        }
        _ => None,
    }
}

fn as_f64(lit: &Literal) -> Option<f64> {
    match lit {
        Literal::Integer(i) => Some(*i as f64),
        Literal::Float(f) => Some(*f),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parse;
    use crate::schema::test_schema;
    use crate::sql::compile_expr;

    fn filter(text: &str) -> Result<String> {
        translate_in(text, TranslationMode::Filter, &Params::new())
    }

    fn translate_in(text: &str, mode: TranslationMode, params: &Params) -> Result<String> {
        let schema = test_schema();
        let mut t = Translator::new(&schema, params);
        t.aliases.generate();
        let ctx = Context::for_table("pubs", "t0").with_mode(mode);
        let node = parse(text)?;
        let expr = if mode.is_filter() {
            t.condition(&node, &ctx)?
        } else {
            t.expression(&node, &ctx)?
        };
        Ok(compile_expr(&expr))
    }

    #[test]
    fn test_operators_reference_both_operands() {
        let cases = [
            ("score = 1", "t0.score = 1"),
            ("score != 1", "t0.score <> 1"),
            ("score < 1", "t0.score < 1"),
            ("score <= 1", "t0.score <= 1"),
            ("score > 1", "t0.score > 1"),
            ("score >= 1", "t0.score >= 1"),
            ("score + 1 > 2", "t0.score + 1 > 2"),
            ("score - 1 > 2", "t0.score - 1 > 2"),
            ("score * 2 > 2", "t0.score * 2 > 2"),
            ("score / 2 > 2", "t0.score / 2 > 2"),
            ("score % 2 = 0", "t0.score % 2 = 0"),
            ("title = 'a' and score > 1", "t0.title = 'a' AND t0.score > 1"),
            ("title = 'a' or score > 1", "t0.title = 'a' OR t0.score > 1"),
            ("title & 'x' = 'ax'", "t0.title || 'x'::text = 'ax'"),
            ("score in [1, 2]", "t0.score IN (1, 2)"),
        ];
        for (input, expected) in cases {
            assert_eq!(filter(input).unwrap(), expected, "for {}", input);
        }
    }

    #[test]
    fn test_plain_comparison_has_no_subquery() {
        let sql = filter("title = 'Some title'").unwrap();
        assert_eq!(sql, "t0.title = 'Some title'");
    }

    #[test]
    fn test_relation_comparison_becomes_exists() {
        let sql = filter("stage.name = 'Stage 1'").unwrap();
        assert_eq!(
            sql,
            "EXISTS (SELECT 1 FROM stages AS t1 WHERE t1.id = t0.\"stageId\" \
             AND t1.name = 'Stage 1')"
        );
    }

    #[test]
    fn test_relation_on_right_mirrors_operator() {
        let sql = filter("3 < stage.order").unwrap();
        assert!(sql.ends_with("AND t1.\"order\" > 3)"), "{}", sql);
    }

    #[test]
    fn test_repeated_relation_joins_once() {
        let sql = translate_in(
            "{\"a\": stage.name, \"b\": stage.order}",
            TranslationMode::Projection,
            &Params::new(),
        )
        .unwrap();
        assert_eq!(
            sql,
            "json_build_object('a'::text, t1.name, 'b'::text, t1.\"order\")"
        );

        let schema = test_schema();
        let params = Params::new();
        let mut t = Translator::new(&schema, &params);
        let ctx = Context::for_table("pubs", "t0");
        let node = parse("$lowercase(stage.name) = 'a' and $length(stage.name) > 2").unwrap();
        t.aliases.generate();
        t.condition(&node, &ctx).unwrap();
        assert_eq!(t.take_joins().len(), 1);
    }

    #[test]
    fn test_projection_siblings_are_isolated() {
        let sql = translate_in(
            "{\"a\": stage.name, \"b\": title}",
            TranslationMode::Projection,
            &Params::new(),
        )
        .unwrap();
        assert_eq!(sql, "json_build_object('a'::text, t1.name, 'b'::text, t0.title)");
    }

    #[test]
    fn test_null_comparison() {
        assert_eq!(filter("title = null").unwrap(), "t0.title IS NULL");
        assert_eq!(filter("title != null").unwrap(), "t0.title IS NOT NULL");
    }

    #[test]
    fn test_json_field_literal_alignment() {
        let schema = test_schema();
        let params = Params::new();
        let mut t = Translator::new(&schema, &params);
        let ctx = Context::for_table("pub_values", "t0").with_mode(TranslationMode::Filter);
        let node = parse("value = 'draft'").unwrap();
        let sql = compile_expr(&t.condition(&node, &ctx).unwrap());
        assert_eq!(sql, "t0.value = '\"draft\"'::jsonb");

        let node = parse("value.color = 'red'").unwrap();
        let sql = compile_expr(&t.condition(&node, &ctx).unwrap());
        assert_eq!(sql, "t0.value->'color'::text = '\"red\"'::jsonb");
    }

    #[test]
    fn test_params_and_bindings() {
        let mut params = Params::new();
        params.insert("min".into(), serde_json::json!(3));
        params.insert("names".into(), serde_json::json!(["a", "b"]));
        params.insert("opts".into(), serde_json::json!({"level": 2}));
        assert_eq!(
            translate_in("score > $min", TranslationMode::Filter, &params).unwrap(),
            "t0.score > 3"
        );
        assert_eq!(
            translate_in("title in $names", TranslationMode::Filter, &params).unwrap(),
            "t0.title IN ('a'::text, 'b'::text)"
        );
        assert_eq!(
            translate_in("score > $opts.level", TranslationMode::Filter, &params).unwrap(),
            "t0.score > 2"
        );
        assert_eq!(
            translate_in("($x := 2; score * $x)", TranslationMode::Projection, &params).unwrap(),
            "t0.score * 2"
        );
        let err = filter("score > $missing").unwrap_err();
        assert_eq!(err.kind(), "MalformedExpressionError");
    }

    #[test]
    fn test_block_bindings_do_not_leak() {
        let err = translate_in("($x := 1; $x) + $x", TranslationMode::Projection, &Params::new())
            .unwrap_err();
        assert!(err.to_string().contains("unbound variable $x"));
    }

    #[test]
    fn test_constant_folding() {
        let sql = translate_in("1 + 2 * 3", TranslationMode::Projection, &Params::new()).unwrap();
        assert_eq!(sql, "7");
        let sql = translate_in("-score", TranslationMode::Projection, &Params::new()).unwrap();
        assert_eq!(sql, "-t0.score");
    }

    #[test]
    fn test_conditional_and_truthiness() {
        let sql = translate_in(
            "score > 10 ? 'high' : 'low'",
            TranslationMode::Projection,
            &Params::new(),
        )
        .unwrap();
        assert_eq!(sql, "CASE WHEN t0.score > 10 THEN 'high' ELSE 'low' END");
        assert_eq!(filter("title").unwrap(), "t0.title IS NOT NULL");
    }

    #[test]
    fn test_unknown_names_fail_fast() {
        assert_eq!(filter("nope = 1").unwrap_err().kind(), "SchemaError");
        assert_eq!(filter("stage.nope = 1").unwrap_err().kind(), "SchemaError");
        assert_eq!(filter("$$nope[0]").unwrap_err().kind(), "SchemaError");
    }

    #[test]
    fn test_unsupported_functions_fail_fast() {
        for input in [
            "$map(attrs, function($v) { $v })",
            "$filter(attrs, function($v) { $v })",
            "$eval('1')",
        ] {
            let result = parse(input).map_err(|e| e.kind()).and_then(|node| {
                let schema = test_schema();
                let params = Params::new();
                let mut t = Translator::new(&schema, &params);
                t.translate(&node, &Context::for_table("pubs", "t0"))
                    .map_err(|e| e.kind())
            });
            assert!(result.is_err(), "{} should fail", input);
        }
    }

    #[test]
    fn test_collection_in_filter_is_rejected() {
        let err = filter("$length(attrs.value) > 1").unwrap_err();
        assert_eq!(err.kind(), "UnsupportedConstructError");
    }

    #[test]
    fn test_collection_in_projection_is_json_array() {
        let sql = translate_in("attrs.value", TranslationMode::Projection, &Params::new()).unwrap();
        assert!(sql.starts_with("(SELECT coalesce(json_agg(t2.item), '[]'::json)"), "{}", sql);
        assert!(sql.contains("WHERE t1.\"pubId\" = t0.id"), "{}", sql);
    }

    #[test]
    fn test_range_outside_brackets() {
        assert_eq!(
            translate_in("[1..3]", TranslationMode::Projection, &Params::new()).unwrap(),
            "ARRAY[1::bigint, 2::bigint, 3::bigint]"
        );
        assert!(translate_in("[1..score]", TranslationMode::Projection, &Params::new()).is_err());
    }

    #[test]
    fn test_non_arithmetic_operator_is_an_error() {
        let score = || TranslationResult::reference("t0", "score", FieldType::Number);
        let err = arithmetic(BinaryOp::Range, score(), score()).unwrap_err();
        assert_eq!(err.kind(), "MalformedExpressionError");
        let sum = arithmetic(BinaryOp::Plus, score(), score()).unwrap();
        assert_eq!(compile_expr(&sum.into_expression()), "t0.score + t0.score");
    }
}
