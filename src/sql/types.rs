//! Statement AST emitted by the translator.
//!
//! This is the statement-builder handle: the translator produces it, callers
//! may extend it (`CompiledQuery::to_builder`, `CompiledFilter::apply`), and
//! the compiler renders it. The AST is designed to be:
//! - Immutable-friendly (clone-based transformations)
//! - Parameter-agnostic (literals become `$n` only at render time, so
//!   splicing fragments never needs renumbering)

/// A SELECT statement with the clauses the translator emits.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectQuery {
    pub distinct: bool,
    pub projections: Vec<SelectItem>,
    pub from: Option<TableRef>,
    pub joins: Vec<Join>,
    pub filter: Option<Expression>,
    pub group_by: Vec<Expression>,
    pub order_by: Vec<OrderByExpr>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// A single item in the SELECT projection list.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    /// `table.*`
    QualifiedWildcard(String),
    /// An expression, optionally aliased: `expr AS alias`.
    Expression {
        expr: Expression,
        alias: Option<String>,
    },
}

/// Table reference in FROM / JOIN.
#[derive(Debug, Clone, PartialEq)]
pub enum TableRef {
    /// `name AS alias`
    Table { name: String, alias: Option<String> },
    /// `(SELECT ...) AS alias`
    Subquery {
        query: Box<SelectQuery>,
        alias: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub join_type: JoinType,
    pub table: TableRef,
    pub on: Expression,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JoinType {
    Inner,
    Left,
}

/// Core expression type. Recursive to support arbitrary nesting.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// Column reference: `table.column` or just `column`.
    Column { table: Option<String>, name: String },
    /// Literal value; rendered inline or as a bound parameter.
    Literal(Literal),
    BinaryOp {
        left: Box<Expression>,
        op: BinaryOperator,
        right: Box<Expression>,
    },
    UnaryOp {
        op: UnaryOperator,
        expr: Box<Expression>,
    },
    /// Function call: `name(args)`.
    Function {
        name: String,
        args: Vec<Expression>,
        distinct: bool,
    },
    /// CASE WHEN ... THEN ... [ELSE ...] END
    Case {
        when_clauses: Vec<(Expression, Expression)>,
        else_clause: Option<Box<Expression>>,
    },
    /// Scalar subquery: `(SELECT ...)`.
    Subquery(Box<SelectQuery>),
    /// EXISTS (SELECT ...).
    Exists(Box<SelectQuery>),
    /// expr [NOT] IN (values).
    InList {
        expr: Box<Expression>,
        list: Vec<Expression>,
        negated: bool,
    },
    /// expr IS [NOT] NULL.
    IsNull {
        expr: Box<Expression>,
        negated: bool,
    },
    /// CAST(expr AS type).
    Cast {
        expr: Box<Expression>,
        data_type: String,
    },
    /// `*` (used in COUNT(*)).
    Wildcard,
    /// `ARRAY[...]`.
    Array(Vec<Expression>),
    /// JSON access: `expr->key`, `expr->>key`, `expr#>>'{}'`.
    JsonAccess {
        expr: Box<Expression>,
        path: Box<Expression>,
        as_text: bool,
    },
    /// Type-cast using `::` operator (PostgreSQL specific).
    TypeCast {
        expr: Box<Expression>,
        data_type: String,
    },
    /// Parenthesized expression.
    Nested(Box<Expression>),
    /// Trusted SQL fragment emitted verbatim (never user text).
    Raw(String),
}

/// Literal values in SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    /// A JSON document, compared against `jsonb` columns.
    Json(serde_json::Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    // Comparison
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    // Logical
    And,
    Or,
    // Arithmetic
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    // String
    Concat,
    // JSON
    JsonConcat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Not,
    Minus,
}

/// ORDER BY expression.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderByExpr {
    pub expr: Expression,
    pub asc: Option<bool>,
}

impl Expression {
    pub fn column(table: impl Into<String>, name: impl Into<String>) -> Self {
        Expression::Column {
            table: Some(table.into()),
            name: name.into(),
        }
    }

    pub fn function(name: impl Into<String>, args: Vec<Expression>) -> Self {
        Expression::Function {
            name: name.into(),
            args,
            distinct: false,
        }
    }

    pub fn binary(left: Expression, op: BinaryOperator, right: Expression) -> Self {
        Expression::BinaryOp {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn string(value: impl Into<String>) -> Self {
        Expression::Literal(Literal::String(value.into()))
    }

    /// Text of a JSON value: `expr#>>'{}'`.
    pub fn json_text(expr: Expression) -> Self {
        Expression::JsonAccess {
            expr: Box::new(expr),
            path: Box::new(Expression::Array(Vec::new())),
            as_text: true,
        }
    }

    /// AND-combine a list of conditions; `None` when empty.
    pub fn conjunction(conditions: Vec<Expression>) -> Option<Expression> {
        conditions
            .into_iter()
            .reduce(|acc, next| Expression::binary(acc, BinaryOperator::And, next))
    }
}

impl SelectQuery {
    /// `SELECT ... FROM name AS alias`
    pub fn from_table(name: impl Into<String>, alias: impl Into<String>) -> Self {
        SelectQuery {
            from: Some(TableRef::Table {
                name: name.into(),
                alias: Some(alias.into()),
            }),
            ..Default::default()
        }
    }

    /// AND a condition onto the WHERE clause.
    pub fn and_where(&mut self, condition: Expression) {
        self.filter = Some(match self.filter.take() {
            Some(existing) => Expression::binary(existing, BinaryOperator::And, condition),
            None => condition,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_select_query() {
        let q = SelectQuery::default();
        assert!(!q.distinct);
        assert!(q.projections.is_empty());
        assert!(q.from.is_none());
        assert!(q.filter.is_none());
        assert!(q.limit.is_none());
    }

    #[test]
    fn test_and_where_accumulates() {
        let mut q = SelectQuery::from_table("pubs", "t0");
        q.and_where(Expression::Raw("a".into()));
        q.and_where(Expression::Raw("b".into()));
        match q.filter {
            Some(Expression::BinaryOp {
                op: BinaryOperator::And,
                ..
            }) => {}
            other => panic!("Expected AND, got {:?}", other),
        }
    }

    #[test]
    fn test_conjunction() {
        assert!(Expression::conjunction(vec![]).is_none());
        assert_eq!(
            Expression::conjunction(vec![Expression::Raw("x".into())]),
            Some(Expression::Raw("x".into()))
        );
    }

    #[test]
    fn test_literal_equality() {
        assert_eq!(Literal::Null, Literal::Null);
        assert_eq!(Literal::Boolean(true), Literal::Boolean(true));
        assert_ne!(Literal::Integer(1), Literal::Integer(2));
        assert_eq!(
            Literal::Json(serde_json::json!("a")),
            Literal::Json(serde_json::json!("a"))
        );
    }
}
