//! Translation result.
//!
//! Different node kinds yield different artifacts: a column reference can
//! still be typed against its field, a literal can still be re-encoded for
//! the column it is compared with, and a statement has to be wrapped before
//! it can be used as a value.
use crate::schema::FieldType;
use crate::sql::{Expression, Literal, SelectQuery};

#[derive(Debug, Clone, PartialEq)]
pub enum TranslationResult {
    Literal(Literal),
    Reference {
        column: String,
        table_alias: String,
        field_type: FieldType,
    },
    Expression(Expression),
    Query(Box<SelectQuery>),
}

impl TranslationResult {
    pub fn reference(
        table_alias: impl Into<String>,
        column: impl Into<String>,
        field_type: FieldType,
    ) -> Self {
        TranslationResult::Reference {
            column: column.into(),
            table_alias: table_alias.into(),
            field_type,
        }
    }

    /// The value as a SQL expression; statements become scalar subqueries.
    pub fn into_expression(self) -> Expression {
        match self {
            TranslationResult::Literal(lit) => Expression::Literal(lit),
            TranslationResult::Reference {
                column,
                table_alias,
                ..
            } => Expression::column(table_alias, column),
            TranslationResult::Expression(expr) => expr,
            TranslationResult::Query(q) => Expression::Subquery(q),
        }
    }

    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            TranslationResult::Reference { field_type, .. } => Some(*field_type),
            _ => None,
        }
    }

    pub fn as_literal(&self) -> Option<&Literal> {
        match self {
            TranslationResult::Literal(lit) => Some(lit),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, TranslationResult::Literal(Literal::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_into_column() {
        let r = TranslationResult::reference("t0", "title", FieldType::Text);
        assert_eq!(r.field_type(), Some(FieldType::Text));
        assert_eq!(r.into_expression(), Expression::column("t0", "title"));
    }

    #[test]
    fn test_query_into_subquery() {
        let q = SelectQuery::from_table("stages", "t1");
        let r = TranslationResult::Query(Box::new(q.clone()));
        assert_eq!(r.into_expression(), Expression::Subquery(Box::new(q)));
    }

    #[test]
    fn test_null_literal() {
        assert!(TranslationResult::Literal(Literal::Null).is_null());
        assert!(!TranslationResult::Literal(Literal::Integer(0)).is_null());
    }
}
