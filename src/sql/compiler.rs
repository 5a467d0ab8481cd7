/// Statement AST → SQL compiler.
///
/// Renders the statement AST as PostgreSQL text. Two renderings share one
/// walker: inline (literals quoted in place, for display and logging) and
/// parameterized (literals become `$1`, `$2`, ... in order of appearance and
/// are returned alongside the text).
use super::formatter;
use super::types::*;

/// Compile a statement with literals inlined.
pub fn compile(select: &SelectQuery) -> String {
    SqlWriter::inline().select(select)
}

/// Compile a statement with literals bound as positional parameters.
pub fn compile_parameterized(select: &SelectQuery) -> (String, Vec<Literal>) {
    let mut writer = SqlWriter::parameterized();
    let sql = writer.select(select);
    (sql, writer.into_params())
}

/// Compile a standalone expression fragment with literals inlined.
pub fn compile_expr(expr: &Expression) -> String {
    SqlWriter::inline().expr(expr)
}

pub(crate) struct SqlWriter {
    params: Option<Vec<Literal>>,
    pretty: bool,
    depth: usize,
}

impl SqlWriter {
    pub(crate) fn inline() -> Self {
        SqlWriter {
            params: None,
            pretty: false,
            depth: 0,
        }
    }

    pub(crate) fn parameterized() -> Self {
        SqlWriter {
            params: Some(Vec::new()),
            pretty: false,
            depth: 0,
        }
    }

    pub(crate) fn pretty(mut self) -> Self {
        self.pretty = true;
        self
    }

    pub(crate) fn into_params(self) -> Vec<Literal> {
        self.params.unwrap_or_default()
    }

    pub(crate) fn select(&mut self, select: &SelectQuery) -> String {
        let mut parts = Vec::new();

        // SELECT [DISTINCT]
        let items: Vec<String> = if select.projections.is_empty() {
            vec!["*".to_string()]
        } else {
            select
                .projections
                .iter()
                .map(|item| self.select_item(item))
                .collect()
        };
        let keyword = if select.distinct {
            "SELECT DISTINCT"
        } else {
            "SELECT"
        };
        let list = if self.pretty {
            formatter::join_select_items(&items, self.depth)
        } else {
            format!(" {}", items.join(", "))
        };
        parts.push(format!("{}{}", keyword, list));

        // FROM
        if let Some(ref from) = select.from {
            let table = self.table_ref(from);
            parts.push(format!("FROM {}", table));
        }

        // JOINs
        for join in &select.joins {
            let rendered = self.join(join);
            parts.push(rendered);
        }

        // WHERE
        if let Some(ref filter) = select.filter {
            let rendered = self.expr(filter);
            parts.push(format!("WHERE {}", rendered));
        }

        // GROUP BY
        if !select.group_by.is_empty() {
            let groups: Vec<String> = select.group_by.iter().map(|g| self.expr(g)).collect();
            parts.push(format!("GROUP BY {}", groups.join(", ")));
        }

        // ORDER BY
        if !select.order_by.is_empty() {
            let orders: Vec<String> = select
                .order_by
                .iter()
                .map(|o| self.order_by(o))
                .collect();
            parts.push(format!("ORDER BY {}", orders.join(", ")));
        }

        if let Some(limit) = select.limit {
            parts.push(format!("LIMIT {}", limit));
        }
        if let Some(offset) = select.offset {
            parts.push(format!("OFFSET {}", offset));
        }

        if self.pretty {
            formatter::join_clauses(&parts, self.depth)
        } else {
            parts.join(" ")
        }
    }

    fn select_item(&mut self, item: &SelectItem) -> String {
        match item {
            SelectItem::QualifiedWildcard(table) => format!("{}.*", quote_ident(table)),
            SelectItem::Expression { expr, alias } => {
                let expr_str = self.expr(expr);
                match alias {
                    Some(a) => format!("{} AS {}", expr_str, quote_ident(a)),
                    None => expr_str,
                }
            }
        }
    }

    fn table_ref(&mut self, table: &TableRef) -> String {
        match table {
            TableRef::Table { name, alias } => match alias {
                Some(a) => format!("{} AS {}", quote_ident(name), quote_ident(a)),
                None => quote_ident(name),
            },
            TableRef::Subquery { query, alias } => {
                format!("{} AS {}", self.subquery(query), quote_ident(alias))
            }
        }
    }

    fn join(&mut self, join: &Join) -> String {
        let type_str = match join.join_type {
            JoinType::Inner => "JOIN",
            JoinType::Left => "LEFT JOIN",
        };
        let table = self.table_ref(&join.table);
        let on = self.expr(&join.on);
        format!("{} {} ON {}", type_str, table, on)
    }

    fn order_by(&mut self, order: &OrderByExpr) -> String {
        let mut s = self.expr(&order.expr);
        match order.asc {
            Some(true) => s.push_str(" ASC"),
            Some(false) => s.push_str(" DESC"),
            None => {}
        }
        s
    }

    fn subquery(&mut self, query: &SelectQuery) -> String {
        self.depth += 1;
        let body = self.select(query);
        self.depth -= 1;
        if self.pretty {
            formatter::wrap_nested(&body, self.depth)
        } else {
            format!("({})", body)
        }
    }

    fn literal(&mut self, lit: &Literal) -> String {
        match (&mut self.params, lit) {
            (_, Literal::Null) | (_, Literal::Boolean(_)) | (None, _) => inline_literal(lit),
            (Some(params), _) => {
                params.push(lit.clone());
                match lit {
                    Literal::Json(_) => format!("${}::jsonb", params.len()),
                    _ => format!("${}", params.len()),
                }
            }
        }
    }

    /// Render an operand, parenthesizing when its precedence is lower than
    /// the surrounding operator's.
    fn operand(&mut self, expr: &Expression, parent: u8, right_side: bool) -> String {
        let rendered = self.expr(expr);
        let child = precedence(expr);
        let needs_parens = child < parent || (child == parent && (right_side || parent == 4));
        if needs_parens && child < u8::MAX {
            format!("({})", rendered)
        } else {
            rendered
        }
    }

    pub(crate) fn expr(&mut self, expr: &Expression) -> String {
        match expr {
            Expression::Column { table, name } => match table {
                Some(t) => format!("{}.{}", quote_ident(t), quote_ident(name)),
                None => quote_ident(name),
            },
            Expression::Literal(lit) => self.literal(lit),
            Expression::BinaryOp { left, op, right } => {
                let prec = operator_precedence(*op);
                // AND/OR and the arithmetic operators that associate freely
                // keep flat chains unparenthesized on the left.
                let assoc = matches!(
                    op,
                    BinaryOperator::And
                        | BinaryOperator::Or
                        | BinaryOperator::Plus
                        | BinaryOperator::Multiply
                        | BinaryOperator::Concat
                );
                let l = self.operand(left, prec, false);
                let r = if assoc && precedence(right) == prec && same_operator(right, *op) {
                    self.expr(right)
                } else {
                    self.operand(right, prec, true)
                };
                format!("{} {} {}", l, operator_symbol(*op), r)
            }
            Expression::UnaryOp { op, expr } => match op {
                UnaryOperator::Not => format!("NOT {}", self.operand(expr, 3, false)),
                UnaryOperator::Minus => format!("-{}", self.operand(expr, 7, false)),
            },
            Expression::Function {
                name,
                args,
                distinct,
            } => {
                let distinct_str = if *distinct { "DISTINCT " } else { "" };
                let args_str: Vec<String> = args.iter().map(|a| self.expr(a)).collect();
                format!("{}({}{})", name, distinct_str, args_str.join(", "))
            }
            Expression::Case {
                when_clauses,
                else_clause,
            } => {
                let mut s = String::from("CASE");
                for (when, then) in when_clauses {
                    let w = self.expr(when);
                    let t = self.expr(then);
                    s.push_str(&format!(" WHEN {} THEN {}", w, t));
                }
                if let Some(else_expr) = else_clause {
                    let e = self.expr(else_expr);
                    s.push_str(&format!(" ELSE {}", e));
                }
                s.push_str(" END");
                s
            }
            Expression::Subquery(q) => self.subquery(q),
            Expression::Exists(q) => format!("EXISTS {}", self.subquery(q)),
            Expression::InList {
                expr,
                list,
                negated,
            } => {
                let not_str = if *negated { "NOT " } else { "" };
                let target = self.operand(expr, 5, false);
                let items: Vec<String> = list.iter().map(|i| self.expr(i)).collect();
                format!("{} {}IN ({})", target, not_str, items.join(", "))
            }
            Expression::IsNull { expr, negated } => {
                let target = self.operand(expr, 5, false);
                if *negated {
                    format!("{} IS NOT NULL", target)
                } else {
                    format!("{} IS NULL", target)
                }
            }
            Expression::Cast { expr, data_type } => {
                format!("CAST({} AS {})", self.expr(expr), data_type)
            }
            Expression::Wildcard => "*".to_string(),
            Expression::Array(elems) => {
                let items: Vec<String> = elems.iter().map(|e| self.expr(e)).collect();
                format!("ARRAY[{}]", items.join(", "))
            }
            Expression::JsonAccess {
                expr,
                path,
                as_text,
            } => {
                let target = self.operand(expr, 8, false);
                match path.as_ref() {
                    // Whole document: `#>'{}'` / `#>>'{}'`.
                    Expression::Array(keys) if keys.is_empty() => {
                        let op = if *as_text { "#>>" } else { "#>" };
                        format!("{}{}'{{}}'", target, op)
                    }
                    _ => {
                        let op = if *as_text { "->>" } else { "->" };
                        format!("{}{}{}", target, op, self.expr(path))
                    }
                }
            }
            Expression::TypeCast { expr, data_type } => match expr.as_ref() {
                Expression::JsonAccess { .. } => format!("({})::{}", self.expr(expr), data_type),
                _ => format!("{}::{}", self.operand(expr, 8, false), data_type),
            },
            Expression::Nested(inner) => format!("({})", self.expr(inner)),
            Expression::Raw(sql) => sql.clone(),
        }
    }
}

fn same_operator(expr: &Expression, op: BinaryOperator) -> bool {
    matches!(expr, Expression::BinaryOp { op: o, .. } if *o == op)
}

fn operator_precedence(op: BinaryOperator) -> u8 {
    match op {
        BinaryOperator::Or => 1,
        BinaryOperator::And => 2,
        BinaryOperator::Eq
        | BinaryOperator::NotEq
        | BinaryOperator::Lt
        | BinaryOperator::LtEq
        | BinaryOperator::Gt
        | BinaryOperator::GtEq => 4,
        BinaryOperator::Plus
        | BinaryOperator::Minus
        | BinaryOperator::Concat
        | BinaryOperator::JsonConcat => 5,
        BinaryOperator::Multiply | BinaryOperator::Divide | BinaryOperator::Modulo => 6,
    }
}

/// Precedence of an expression as an operand; atoms never need parentheses.
fn precedence(expr: &Expression) -> u8 {
    match expr {
        Expression::BinaryOp { op, .. } => operator_precedence(*op),
        Expression::UnaryOp {
            op: UnaryOperator::Not,
            ..
        } => 3,
        Expression::IsNull { .. } | Expression::InList { .. } => 4,
        _ => u8::MAX,
    }
}

fn operator_symbol(op: BinaryOperator) -> &'static str {
    match op {
        BinaryOperator::Eq => "=",
        BinaryOperator::NotEq => "<>",
        BinaryOperator::Lt => "<",
        BinaryOperator::LtEq => "<=",
        BinaryOperator::Gt => ">",
        BinaryOperator::GtEq => ">=",
        BinaryOperator::And => "AND",
        BinaryOperator::Or => "OR",
        BinaryOperator::Plus => "+",
        BinaryOperator::Minus => "-",
        BinaryOperator::Multiply => "*",
        BinaryOperator::Divide => "/",
        BinaryOperator::Modulo => "%",
        BinaryOperator::Concat => "||",
        BinaryOperator::JsonConcat => "||",
    }
}

fn inline_literal(lit: &Literal) -> String {
    match lit {
        Literal::Null => "NULL".to_string(),
        Literal::Boolean(b) => {
            if *b {
                "TRUE".to_string()
            } else {
                "FALSE".to_string()
            }
        }
        Literal::Integer(i) => i.to_string(),
        Literal::Float(f) => format!("{}", f),
        Literal::String(s) => format!("'{}'", s.replace('\'', "''")),
        Literal::Json(v) => format!("'{}'::jsonb", v.to_string().replace('\'', "''")),
    }
}

const RESERVED: &[&str] = &[
    "all", "and", "any", "array", "as", "asc", "case", "cast", "check", "column", "constraint",
    "create", "default", "desc", "distinct", "do", "else", "end", "false", "for", "foreign",
    "from", "grant", "group", "having", "in", "into", "is", "join", "limit", "not", "null",
    "offset", "on", "or", "order", "primary", "references", "select", "table", "then", "to",
    "true", "union", "unique", "user", "using", "when", "where", "with",
];

/// Quote an identifier unless it is a plain lower-case, non-reserved name.
pub fn quote_ident(name: &str) -> String {
    let plain = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !RESERVED.contains(&name);
    if plain {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str) -> Expression {
        Expression::column("t0", name)
    }

    #[test]
    fn test_compile_simple_select() {
        let mut q = SelectQuery::from_table("pubs", "t0");
        q.projections.push(SelectItem::QualifiedWildcard("t0".into()));
        assert_eq!(compile(&q), "SELECT t0.* FROM pubs AS t0");
    }

    #[test]
    fn test_compile_parameterized_numbers_in_order() {
        let mut q = SelectQuery::from_table("pubs", "t0");
        q.and_where(Expression::binary(
            col("title"),
            BinaryOperator::Eq,
            Expression::string("a"),
        ));
        q.and_where(Expression::binary(
            col("score"),
            BinaryOperator::Gt,
            Expression::Literal(Literal::Integer(3)),
        ));
        let (sql, params) = compile_parameterized(&q);
        assert_eq!(
            sql,
            "SELECT * FROM pubs AS t0 WHERE t0.title = $1 AND t0.score > $2"
        );
        assert_eq!(
            params,
            vec![Literal::String("a".into()), Literal::Integer(3)]
        );
    }

    #[test]
    fn test_inline_string_escaping() {
        assert_eq!(compile_expr(&Expression::string("it's")), "'it''s'");
        assert_eq!(
            compile_expr(&Expression::Literal(Literal::Json(serde_json::json!("x")))),
            "'\"x\"'::jsonb"
        );
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("title"), "title");
        assert_eq!(quote_ident("createdAt"), "\"createdAt\"");
        assert_eq!(quote_ident("order"), "\"order\"");
        assert_eq!(quote_ident("weird\"name"), "\"weird\"\"name\"");
    }

    #[test]
    fn test_precedence_parenthesizes_or_inside_and() {
        let or = Expression::binary(col("a"), BinaryOperator::Or, col("b"));
        let and = Expression::binary(or, BinaryOperator::And, col("c"));
        assert_eq!(compile_expr(&and), "(t0.a OR t0.b) AND t0.c");

        let sub = Expression::binary(col("b"), BinaryOperator::Minus, col("c"));
        let minus = Expression::binary(col("a"), BinaryOperator::Minus, sub);
        assert_eq!(compile_expr(&minus), "t0.a - (t0.b - t0.c)");

        let chain = Expression::binary(
            Expression::binary(col("a"), BinaryOperator::And, col("b")),
            BinaryOperator::And,
            col("c"),
        );
        assert_eq!(compile_expr(&chain), "t0.a AND t0.b AND t0.c");
    }

    #[test]
    fn test_compile_join_order_limit() {
        let mut q = SelectQuery::from_table("pubs", "t0");
        q.joins.push(Join {
            join_type: JoinType::Left,
            table: TableRef::Table {
                name: "stages".into(),
                alias: Some("t1".into()),
            },
            on: Expression::binary(
                Expression::column("t1", "id"),
                BinaryOperator::Eq,
                col("stageId"),
            ),
        });
        q.order_by.push(OrderByExpr {
            expr: col("createdAt"),
            asc: Some(false),
        });
        q.limit = Some(5);
        q.offset = Some(2);
        assert_eq!(
            compile(&q),
            "SELECT * FROM pubs AS t0 LEFT JOIN stages AS t1 ON t1.id = t0.\"stageId\" \
             ORDER BY t0.\"createdAt\" DESC LIMIT 5 OFFSET 2"
        );
    }

    #[test]
    fn test_compile_exists_and_case() {
        let mut inner = SelectQuery::from_table("stages", "t1");
        inner.projections.push(SelectItem::Expression {
            expr: Expression::Raw("1".into()),
            alias: None,
        });
        let exists = Expression::Exists(Box::new(inner));
        assert_eq!(
            compile_expr(&exists),
            "EXISTS (SELECT 1 FROM stages AS t1)"
        );

        let case = Expression::Case {
            when_clauses: vec![(col("a"), Expression::string("x"))],
            else_clause: Some(Box::new(Expression::Literal(Literal::Null))),
        };
        assert_eq!(compile_expr(&case), "CASE WHEN t0.a THEN 'x' ELSE NULL END");
    }

    #[test]
    fn test_null_and_booleans_stay_inline() {
        let expr = Expression::binary(
            col("flag"),
            BinaryOperator::Eq,
            Expression::Literal(Literal::Boolean(true)),
        );
        let mut q = SelectQuery::from_table("pubs", "t0");
        q.and_where(expr);
        let (sql, params) = compile_parameterized(&q);
        assert!(sql.ends_with("t0.flag = TRUE"));
        assert!(params.is_empty());
    }

    #[test]
    fn test_json_access_forms() {
        let key = Expression::TypeCast {
            expr: Box::new(Expression::string("color")),
            data_type: "text".into(),
        };
        let access = Expression::JsonAccess {
            expr: Box::new(col("value")),
            path: Box::new(key),
            as_text: false,
        };
        assert_eq!(compile_expr(&access), "t0.value->'color'::text");
        assert_eq!(
            compile_expr(&Expression::json_text(col("value"))),
            "t0.value#>>'{}'"
        );
    }
}
