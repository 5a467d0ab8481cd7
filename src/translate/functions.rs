//! Function support catalog and call translation.
//!
//! The catalog is static reference data: every function of the expression
//! language's standard library with its support tier, the SQL it maps to,
//! semantic caveats and an example. Translation consults it first, so an
//! UNSUPPORTED function is rejected before any argument is looked at.
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use serde::Serialize;

use super::context::Context;
use super::expr::Translator;
use super::path::PathRole;
use super::result::TranslationResult;
use crate::error::{Result, TranslateError};
use crate::expr::{ExprNode, UnaryNode};
use crate::sql::{BinaryOperator, Expression, Literal, UnaryOperator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SupportTier {
    /// Same result as the expression language for all inputs.
    Full,
    /// Translates, with documented differences.
    Partial,
    /// No translation; rejected before SQL is produced.
    Unsupported,
    /// Translation depends on where the call appears.
    Contextual,
}

impl SupportTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupportTier::Full => "FULL",
            SupportTier::Partial => "PARTIAL",
            SupportTier::Unsupported => "UNSUPPORTED",
            SupportTier::Contextual => "CONTEXTUAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "FULL" => Some(SupportTier::Full),
            "PARTIAL" => Some(SupportTier::Partial),
            "UNSUPPORTED" => Some(SupportTier::Unsupported),
            "CONTEXTUAL" => Some(SupportTier::Contextual),
            _ => None,
        }
    }
}

impl fmt::Display for SupportTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct FunctionSpec {
    pub name: &'static str,
    pub category: &'static str,
    pub tier: SupportTier,
    pub sql: &'static str,
    pub caveats: &'static str,
    pub example: &'static str,
}

macro_rules! function {
    ($name:literal, $category:literal, $tier:ident, $sql:literal, $caveats:literal, $example:literal) => {
        FunctionSpec {
            name: $name,
            category: $category,
            tier: SupportTier::$tier,
            sql: $sql,
            caveats: $caveats,
            example: $example,
        }
    };
}

pub static FUNCTIONS: &[FunctionSpec] = &[
    // String
    function!("string", "string", Partial, "CAST(x AS text)", "Objects and arrays are not serialized as JSON text; no prettify argument.", "$string(score)"),
    function!("length", "string", Full, "char_length(s)", "", "$length(title) > 10"),
    function!("substring", "string", Full, "substr(s, start + 1, length)", "Start is 0-based and shifted by one; a negative literal start is rejected.", "$substring(title, 0, 5)"),
    function!("substringBefore", "string", Full, "split_part(s, chars, 1)", "", "$substringBefore(title, ':')"),
    function!("substringAfter", "string", Full, "CASE WHEN strpos(s, c) > 0 THEN substr(s, strpos(s, c) + char_length(c)) ELSE s END", "", "$substringAfter(title, ':')"),
    function!("uppercase", "string", Full, "upper(s)", "", "$uppercase(title)"),
    function!("lowercase", "string", Full, "lower(s)", "", "$lowercase(stage.name) = 'draft'"),
    function!("trim", "string", Full, "trim(regexp_replace(s, '\\s+', ' ', 'g'))", "", "$trim(title)"),
    function!("pad", "string", Partial, "rpad(s, width, char) / lpad(s, -width, char)", "Width must be an integer literal; strings longer than the width are truncated.", "$pad(title, 10, '#')"),
    function!("contains", "string", Partial, "strpos(s, pattern) > 0", "Regular-expression patterns are not supported.", "$contains(title, 'draft')"),
    function!("split", "string", Partial, "string_to_array(s, separator)", "Regular-expression separators and the limit argument are not supported.", "$split(title, ' ')"),
    function!("join", "string", Full, "array_to_string(array, separator)", "", "$join(tags, ', ')"),
    function!("replace", "string", Partial, "replace(s, pattern, replacement)", "Regular-expression patterns and the limit argument are not supported.", "$replace(title, 'a', 'b')"),
    function!("match", "string", Unsupported, "", "Regular expressions are outside the query subset.", "$match(title, /a+/)"),
    function!("base64encode", "string", Full, "encode(convert_to(s, 'UTF8'), 'base64')", "", "$base64encode(title)"),
    function!("base64decode", "string", Full, "convert_from(decode(s, 'base64'), 'UTF8')", "", "$base64decode(token)"),
    function!("encodeUrlComponent", "string", Unsupported, "", "No SQL equivalent.", "$encodeUrlComponent(title)"),
    function!("encodeUrl", "string", Unsupported, "", "No SQL equivalent.", "$encodeUrl(link)"),
    function!("decodeUrlComponent", "string", Unsupported, "", "No SQL equivalent.", "$decodeUrlComponent(title)"),
    function!("decodeUrl", "string", Unsupported, "", "No SQL equivalent.", "$decodeUrl(link)"),
    function!("eval", "string", Unsupported, "", "Dynamic evaluation cannot be compiled ahead of time.", "$eval(expr)"),
    // Numeric
    function!("number", "numeric", Partial, "CAST(x AS numeric)", "Hex, octal and binary string forms are not recognized.", "$number(code) > 3"),
    function!("abs", "numeric", Full, "abs(n)", "", "$abs(delta)"),
    function!("floor", "numeric", Full, "floor(n)", "", "$floor(score)"),
    function!("ceil", "numeric", Full, "ceil(n)", "", "$ceil(score)"),
    function!("round", "numeric", Partial, "round(CAST(n AS numeric), precision)", "Rounds half away from zero instead of half to even.", "$round(score, 2)"),
    function!("power", "numeric", Full, "power(base, exponent)", "", "$power(score, 2)"),
    function!("sqrt", "numeric", Full, "sqrt(n)", "", "$sqrt(score)"),
    function!("random", "numeric", Full, "random()", "", "$random()"),
    function!("formatNumber", "numeric", Unsupported, "", "Picture strings have no SQL equivalent.", "$formatNumber(score, '#,##0.00')"),
    function!("formatBase", "numeric", Unsupported, "", "No SQL equivalent.", "$formatBase(score, 2)"),
    function!("formatInteger", "numeric", Unsupported, "", "Word and roman-numeral pictures have no SQL equivalent.", "$formatInteger(score, 'w')"),
    function!("parseInteger", "numeric", Unsupported, "", "Word and roman-numeral pictures have no SQL equivalent.", "$parseInteger('twelve', 'w')"),
    // Aggregation
    function!("sum", "aggregate", Contextual, "sum(x) / (SELECT coalesce(sum(...), 0) FROM ...)", "Inline over a field (caller supplies grouping); a correlated subquery over a relation or table path.", "$sum(attrs.score)"),
    function!("count", "aggregate", Contextual, "count(x) / (SELECT count(*) FROM ...)", "Inline over a field; a correlated subquery over a relation or table path.", "$count($$pubs[stage.name = 'Published'])"),
    function!("max", "aggregate", Contextual, "max(x) / (SELECT max(...) FROM ...)", "As $sum.", "$max($$pubs.score)"),
    function!("min", "aggregate", Contextual, "min(x) / (SELECT min(...) FROM ...)", "As $sum.", "$min($$pubs.score)"),
    function!("average", "aggregate", Contextual, "avg(x) / (SELECT avg(...) FROM ...)", "As $sum.", "$average($$pubs.score)"),
    // Boolean
    function!("boolean", "boolean", Partial, "CAST(x AS boolean)", "Only values PostgreSQL can cast are accepted; empty strings and arrays raise at execution.", "$boolean(flag)"),
    function!("not", "boolean", Full, "NOT x", "", "$not(archived)"),
    function!("exists", "boolean", Contextual, "x IS NOT NULL / EXISTS (SELECT 1 ...)", "A relation or table path becomes an EXISTS subquery.", "$exists(stage.name)"),
    // Array
    function!("append", "array", Partial, "to_jsonb(a) || to_jsonb(b)", "Result is a jsonb array.", "$append(tags, 'new')"),
    function!("sort", "array", Unsupported, "", "Use the ^( ) sort operator on a path instead.", "$sort(tags)"),
    function!("reverse", "array", Unsupported, "", "No row-independent SQL equivalent.", "$reverse(tags)"),
    function!("shuffle", "array", Unsupported, "", "No deterministic SQL equivalent.", "$shuffle(tags)"),
    function!("distinct", "array", Unsupported, "", "No row-independent SQL equivalent.", "$distinct(tags)"),
    function!("zip", "array", Unsupported, "", "No SQL equivalent.", "$zip(a, b)"),
    // Object
    function!("keys", "object", Partial, "jsonb_path_query_array(to_jsonb(o), '$.keyvalue().key')", "Result is a jsonb array.", "$keys(value)"),
    function!("lookup", "object", Partial, "to_jsonb(o) -> key", "Result is jsonb.", "$lookup(value, 'color')"),
    function!("spread", "object", Unsupported, "", "No SQL equivalent.", "$spread(value)"),
    function!("merge", "object", Partial, "to_jsonb(a) || to_jsonb(b) || ...", "The argument must be an array constructor.", "$merge([a, b])"),
    function!("type", "object", Partial, "jsonb_typeof(to_jsonb(x))", "Functions are never values in SQL.", "$type(value) = 'string'"),
    function!("error", "object", Unsupported, "", "Raising errors is not a query operation.", "$error('x')"),
    function!("assert", "object", Unsupported, "", "Raising errors is not a query operation.", "$assert(x, 'msg')"),
    // Date/time
    function!("now", "datetime", Partial, "now()", "Returns a timestamp, not an ISO 8601 string; picture and timezone arguments are not supported.", "createdAt < $now()"),
    function!("millis", "datetime", Full, "CAST(date_part('epoch', now()) * 1000 AS bigint)", "", "$millis()"),
    function!("fromMillis", "datetime", Partial, "to_timestamp(CAST(n AS double precision) / 1000)", "Returns a timestamp, not an ISO 8601 string.", "$fromMillis(1700000000000)"),
    function!("toMillis", "datetime", Partial, "CAST(date_part('epoch', CAST(s AS timestamptz)) * 1000 AS bigint)", "Picture argument not supported.", "$toMillis(createdAt)"),
    // Higher-order
    function!("map", "higher-order", Unsupported, "", "Requires a row-level lambda.", "$map(tags, function($t) { $uppercase($t) })"),
    function!("filter", "higher-order", Unsupported, "", "Requires a row-level lambda; use a [predicate] on a path.", "$filter(tags, function($t) { $t != '' })"),
    function!("reduce", "higher-order", Unsupported, "", "Requires a row-level lambda.", "$reduce(scores, function($a, $b) { $a + $b })"),
    function!("single", "higher-order", Unsupported, "", "Requires a row-level lambda.", "$single(tags, function($t) { $t = 'a' })"),
    function!("sift", "higher-order", Unsupported, "", "Requires a row-level lambda.", "$sift(value, function($v) { $v })"),
    function!("each", "higher-order", Unsupported, "", "Requires a row-level lambda.", "$each(value, function($v, $k) { $k })"),
];

fn index() -> &'static HashMap<&'static str, &'static FunctionSpec> {
    static INDEX: OnceLock<HashMap<&'static str, &'static FunctionSpec>> = OnceLock::new();
    INDEX.get_or_init(|| FUNCTIONS.iter().map(|f| (f.name, f)).collect())
}

/// Catalog entry for `name` (without the leading `$`).
pub fn lookup_function(name: &str) -> Option<&'static FunctionSpec> {
    index().get(name).copied()
}

pub fn functions_by_tier(tier: SupportTier) -> impl Iterator<Item = &'static FunctionSpec> {
    FUNCTIONS.iter().filter(move |f| f.tier == tier)
}

/// Error for a function the catalog rejects or does not know.
pub fn check_supported(name: &str, node: &ExprNode) -> Result<&'static FunctionSpec> {
    match lookup_function(name) {
        Some(spec) if spec.tier == SupportTier::Unsupported => Err(TranslateError::unsupported(
            format!("function ${} ({})", name, spec.caveats),
            node,
        )),
        Some(spec) => Ok(spec),
        None => Err(TranslateError::unsupported(
            format!("unknown function ${}", name),
            node,
        )),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Sum,
    Count,
    Average,
    Min,
    Max,
}

impl Aggregate {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sum" => Some(Aggregate::Sum),
            "count" => Some(Aggregate::Count),
            "average" => Some(Aggregate::Average),
            "min" => Some(Aggregate::Min),
            "max" => Some(Aggregate::Max),
            _ => None,
        }
    }

    pub fn jsonata_name(&self) -> &'static str {
        match self {
            Aggregate::Sum => "sum",
            Aggregate::Count => "count",
            Aggregate::Average => "average",
            Aggregate::Min => "min",
            Aggregate::Max => "max",
        }
    }

    pub fn sql_name(&self) -> &'static str {
        match self {
            Aggregate::Sum => "sum",
            Aggregate::Count => "count",
            Aggregate::Average => "avg",
            Aggregate::Min => "min",
            Aggregate::Max => "max",
        }
    }

    /// Aggregate call; sums of no rows are 0 as in the expression language.
    pub fn apply(&self, arg: Expression) -> Expression {
        let call = Expression::function(self.sql_name(), vec![arg]);
        match self {
            Aggregate::Sum => Expression::function(
                "coalesce",
                vec![call, constant(0)],
            ),
            _ => call,
        }
    }
}

fn arity(name: &str, args: &[ExprNode], node: &ExprNode, min: usize, max: usize) -> Result<()> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("{}", min)
        } else {
            format!("{} to {}", min, max)
        };
        return Err(TranslateError::malformed(
            format!(
                "${} takes {} argument(s), got {}",
                name,
                expected,
                args.len()
            ),
            node,
        ));
    }
    Ok(())
}

fn call(name: &str, args: Vec<Expression>) -> Expression {
    Expression::function(name, args)
}

fn cast(expr: Expression, data_type: &str) -> Expression {
    Expression::Cast {
        expr: Box::new(expr),
        data_type: data_type.into(),
    }
}

/// Integer that is part of a translation template, rendered inline.
fn constant(n: i64) -> Expression {
    Expression::Raw(n.to_string())
}

fn string(value: &str) -> Expression {
    Expression::string(value)
}

/// Give a bare literal an explicit type where PostgreSQL cannot infer one
/// (polymorphic function arguments).
pub(crate) fn typed(result: TranslationResult) -> Expression {
    let data_type = match &result {
        TranslationResult::Literal(Literal::String(_)) => "text",
        TranslationResult::Literal(Literal::Integer(_)) => "bigint",
        TranslationResult::Literal(Literal::Float(_)) => "double precision",
        _ => return result.into_expression(),
    };
    Expression::TypeCast {
        expr: Box::new(result.into_expression()),
        data_type: data_type.into(),
    }
}

pub(crate) fn to_jsonb(result: TranslationResult) -> Expression {
    match result {
        TranslationResult::Literal(Literal::Json(v)) => Expression::Literal(Literal::Json(v)),
        other => call("to_jsonb", vec![typed(other)]),
    }
}

impl Translator<'_> {
    /// Translate `$name(args)`.
    pub(crate) fn function_call(
        &mut self,
        name: &str,
        args: &[ExprNode],
        node: &ExprNode,
        ctx: &Context,
    ) -> Result<TranslationResult> {
        check_supported(name, node)?;

        if let Some(aggregate) = Aggregate::from_name(name) {
            arity(name, args, node, 1, 1)?;
            return self.aggregate_call(aggregate, &args[0], ctx);
        }

        let expr = match name {
            "exists" => {
                arity(name, args, node, 1, 1)?;
                if let Some(steps) = self.navigation(&args[0], ctx) {
                    let acc = self.fold_path(&steps, ctx, PathRole::Nested)?;
                    let condition = (!acc.projects_rows()).then(|| Expression::IsNull {
                        expr: Box::new(acc.item()),
                        negated: true,
                    });
                    return Ok(TranslationResult::Expression(
                        self.exists_subquery(&acc, condition),
                    ));
                }
                match self.translate(&args[0], ctx)? {
                    TranslationResult::Literal(lit) => {
                        Expression::Literal(Literal::Boolean(lit != Literal::Null))
                    }
                    other => Expression::IsNull {
                        expr: Box::new(other.into_expression()),
                        negated: true,
                    },
                }
            }
            "contains" => {
                arity(name, args, node, 2, 2)?;
                let pattern = self.expression(&args[1], ctx)?;
                if let Some(steps) = self.navigation(&args[0], ctx) {
                    let acc = self.fold_path(&steps, ctx, PathRole::Nested)?;
                    if acc.projects_rows() {
                        return Err(TranslateError::malformed(
                            "$contains needs a field, not a row",
                            node,
                        ));
                    }
                    let condition = contains(json_text(acc.item(), &acc), pattern);
                    return Ok(TranslationResult::Expression(
                        self.exists_subquery(&acc, Some(condition)),
                    ));
                }
                let haystack = self.expression(&args[0], ctx)?;
                contains(haystack, pattern)
            }
            "not" => {
                arity(name, args, node, 1, 1)?;
                Expression::UnaryOp {
                    op: UnaryOperator::Not,
                    expr: Box::new(self.condition(&args[0], ctx)?),
                }
            }
            "substring" => {
                arity(name, args, node, 2, 3)?;
                let s = self.expression(&args[0], ctx)?;
                let start = match self.translate(&args[1], ctx)? {
                    TranslationResult::Literal(Literal::Integer(n)) if n < 0 => {
                        return Err(TranslateError::unsupported(
                            "$substring with a negative start",
                            node,
                        ))
                    }
                    TranslationResult::Literal(Literal::Integer(n)) => {
                        constant(n + 1)
                    }
                    other => Expression::binary(
                        other.into_expression(),
                        BinaryOperator::Plus,
                        constant(1),
                    ),
                };
                let mut call_args = vec![s, start];
                if let Some(len) = args.get(2) {
                    call_args.push(self.expression(len, ctx)?);
                }
                call("substr", call_args)
            }
            "substringAfter" => {
                arity(name, args, node, 2, 2)?;
                let s = self.expression(&args[0], ctx)?;
                let c = self.expression(&args[1], ctx)?;
                let position = call("strpos", vec![s.clone(), c.clone()]);
                Expression::Case {
                    when_clauses: vec![(
                        Expression::binary(
                            position.clone(),
                            BinaryOperator::Gt,
                            constant(0),
                        ),
                        call(
                            "substr",
                            vec![
                                s.clone(),
                                Expression::binary(
                                    position,
                                    BinaryOperator::Plus,
                                    call("char_length", vec![c]),
                                ),
                            ],
                        ),
                    )],
                    else_clause: Some(Box::new(s)),
                }
            }
            "pad" => {
                arity(name, args, node, 2, 3)?;
                let s = self.expression(&args[0], ctx)?;
                let width = args[1].as_index().ok_or_else(|| {
                    TranslateError::unsupported("$pad width must be a safe integer literal", node)
                })?;
                let fill = match args.get(2) {
                    Some(c) => self.expression(c, ctx)?,
                    None => string(" "),
                };
                let (function, width) = if width < 0 {
                    let width = width
                        .checked_neg()
                        .ok_or_else(|| TranslateError::malformed("$pad width out of range", node))?;
                    ("lpad", width)
                } else {
                    ("rpad", width)
                };
                call(
                    function,
                    vec![s, constant(width), fill],
                )
            }
            "split" => {
                arity(name, args, node, 2, 3)?;
                if args.len() == 3 {
                    return Err(TranslateError::unsupported("$split with a limit", node));
                }
                let args = self.expressions(args, ctx)?;
                call("string_to_array", args)
            }
            "replace" => {
                arity(name, args, node, 3, 4)?;
                if args.len() == 4 {
                    return Err(TranslateError::unsupported("$replace with a limit", node));
                }
                let args = self.expressions(args, ctx)?;
                call("replace", args)
            }
            "join" => {
                arity(name, args, node, 1, 2)?;
                let array = self.expression(&args[0], ctx)?;
                let separator = match args.get(1) {
                    Some(sep) => self.expression(sep, ctx)?,
                    None => string(""),
                };
                call("array_to_string", vec![array, separator])
            }
            "string" => {
                arity(name, args, node, 1, 1)?;
                match self.translate(&args[0], ctx)? {
                    TranslationResult::Literal(Literal::String(s)) => {
                        Expression::Literal(Literal::String(s))
                    }
                    other => cast(other.into_expression(), "text"),
                }
            }
            "length" => self.simple(name, "char_length", args, node, ctx, 1)?,
            "substringBefore" => {
                arity(name, args, node, 2, 2)?;
                let mut call_args = self.expressions(args, ctx)?;
                call_args.push(constant(1));
                call("split_part", call_args)
            }
            "uppercase" => self.simple(name, "upper", args, node, ctx, 1)?,
            "lowercase" => self.simple(name, "lower", args, node, ctx, 1)?,
            "trim" => {
                arity(name, args, node, 1, 1)?;
                let s = self.expression(&args[0], ctx)?;
                call(
                    "trim",
                    vec![call(
                        "regexp_replace",
                        vec![s, string("\\s+"), string(" "), string("g")],
                    )],
                )
            }
            "base64encode" => {
                arity(name, args, node, 1, 1)?;
                let s = self.expression(&args[0], ctx)?;
                call(
                    "encode",
                    vec![call("convert_to", vec![s, string("UTF8")]), string("base64")],
                )
            }
            "base64decode" => {
                arity(name, args, node, 1, 1)?;
                let s = self.expression(&args[0], ctx)?;
                call(
                    "convert_from",
                    vec![call("decode", vec![s, string("base64")]), string("UTF8")],
                )
            }
            "number" => {
                arity(name, args, node, 1, 1)?;
                match self.translate(&args[0], ctx)? {
                    TranslationResult::Literal(lit @ (Literal::Integer(_) | Literal::Float(_))) => {
                        Expression::Literal(lit)
                    }
                    other => cast(other.into_expression(), "numeric"),
                }
            }
            "abs" | "floor" | "ceil" | "sqrt" => self.simple(name, name, args, node, ctx, 1)?,
            "power" => self.simple(name, "power", args, node, ctx, 2)?,
            "round" => {
                arity(name, args, node, 1, 2)?;
                let n = self.expression(&args[0], ctx)?;
                let precision = match args.get(1) {
                    Some(p) => self.expression(p, ctx)?,
                    None => constant(0),
                };
                call("round", vec![cast(n, "numeric"), precision])
            }
            "random" => {
                arity(name, args, node, 0, 0)?;
                call("random", vec![])
            }
            "boolean" => {
                arity(name, args, node, 1, 1)?;
                cast(self.expression(&args[0], ctx)?, "boolean")
            }
            "append" => {
                arity(name, args, node, 2, 2)?;
                let a = self.translate(&args[0], ctx)?;
                let b = self.translate(&args[1], ctx)?;
                Expression::binary(to_jsonb(a), BinaryOperator::JsonConcat, to_jsonb(b))
            }
            "keys" => {
                arity(name, args, node, 1, 1)?;
                let o = self.translate(&args[0], ctx)?;
                call(
                    "jsonb_path_query_array",
                    vec![to_jsonb(o), Expression::Raw("'$.keyvalue().key'::jsonpath".into())],
                )
            }
            "lookup" => {
                arity(name, args, node, 2, 2)?;
                let o = self.translate(&args[0], ctx)?;
                let key = self.translate(&args[1], ctx)?;
                Expression::JsonAccess {
                    expr: Box::new(to_jsonb(o)),
                    path: Box::new(typed(key)),
                    as_text: false,
                }
            }
            "merge" => {
                arity(name, args, node, 1, 1)?;
                let items = match &args[0] {
                    ExprNode::Unary(UnaryNode::Array(items)) if !items.is_empty() => items,
                    _ => {
                        return Err(TranslateError::unsupported(
                            "$merge over anything but an array constructor",
                            node,
                        ))
                    }
                };
                let mut merged: Option<Expression> = None;
                for item in items {
                    let value = to_jsonb(self.translate(item, ctx)?);
                    merged = Some(match merged {
                        Some(acc) => Expression::binary(acc, BinaryOperator::JsonConcat, value),
                        None => value,
                    });
                }
                merged.unwrap_or(Expression::Literal(Literal::Null))
            }
            "type" => {
                arity(name, args, node, 1, 1)?;
                let x = self.translate(&args[0], ctx)?;
                call("jsonb_typeof", vec![to_jsonb(x)])
            }
            "now" => {
                arity(name, args, node, 0, 0)?;
                call("now", vec![])
            }
            "millis" => {
                arity(name, args, node, 0, 0)?;
                epoch_millis(call("now", vec![]))
            }
            "fromMillis" => {
                arity(name, args, node, 1, 1)?;
                let n = self.expression(&args[0], ctx)?;
                call(
                    "to_timestamp",
                    vec![Expression::binary(
                        cast(n, "double precision"),
                        BinaryOperator::Divide,
                        constant(1000),
                    )],
                )
            }
            "toMillis" => {
                arity(name, args, node, 1, 1)?;
                let s = self.expression(&args[0], ctx)?;
                epoch_millis(cast(s, "timestamptz"))
            }
            other => {
                return Err(TranslateError::unsupported(
                    format!("function ${} has no translation rule", other),
                    node,
                ))
            }
        };
        Ok(TranslationResult::Expression(expr))
    }

    fn simple(
        &mut self,
        name: &str,
        sql_name: &str,
        args: &[ExprNode],
        node: &ExprNode,
        ctx: &Context,
        count: usize,
    ) -> Result<Expression> {
        arity(name, args, node, count, count)?;
        let args = self.expressions(args, ctx)?;
        Ok(call(sql_name, args))
    }

    fn expressions(&mut self, args: &[ExprNode], ctx: &Context) -> Result<Vec<Expression>> {
        args.iter().map(|a| self.expression(a, ctx)).collect()
    }

    /// Inline aggregate over a value, or a scalar subquery over a relation
    /// or table path.
    fn aggregate_call(
        &mut self,
        aggregate: Aggregate,
        arg: &ExprNode,
        ctx: &Context,
    ) -> Result<TranslationResult> {
        if let Some(steps) = self.navigation(arg, ctx) {
            let acc = self.fold_path(&steps, ctx, PathRole::Nested)?;
            let statement = self.aggregate_statement(&acc, aggregate, None)?;
            return Ok(TranslationResult::Query(Box::new(statement)));
        }
        if let ExprNode::Unary(UnaryNode::Array(_)) = arg {
            return Err(TranslateError::unsupported(
                format!("${} over an array constructor", aggregate.jsonata_name()),
                arg,
            ));
        }
        let value = self.expression(arg, ctx)?;
        Ok(TranslationResult::Expression(aggregate.apply(value)))
    }
}

pub(crate) fn contains(haystack: Expression, needle: Expression) -> Expression {
    Expression::binary(
        call("strpos", vec![haystack, needle]),
        BinaryOperator::Gt,
        constant(0),
    )
}

/// Text of a JSON value (`#>> '{}'`) when the path ends in a JSON field.
fn json_text(item: Expression, acc: &super::path::PathAcc) -> Expression {
    match &acc.projection {
        super::path::Projection::Column {
            field_type: crate::schema::FieldType::Json,
            ..
        } => Expression::json_text(item),
        _ => item,
    }
}

fn epoch_millis(timestamp: Expression) -> Expression {
    cast(
        Expression::binary(
            call("date_part", vec![string("epoch"), timestamp]),
            BinaryOperator::Multiply,
            constant(1000),
        ),
        "bigint",
    )
}
