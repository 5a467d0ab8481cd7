//! Error taxonomy for expression translation.
//!
//! Every error is raised synchronously, before any SQL text is handed to an
//! executor. I/O-facing code (schema files, database access, CLI) wraps these
//! in `anyhow` at its own boundary.
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TranslateError {
    /// Expression text could not be tokenized or parsed.
    #[error("Parse error at position {position}: {message}")]
    Parse { message: String, position: usize },

    /// Unknown table, relation or field, or an invalid schema description.
    #[error("Schema error: {0}")]
    Schema(String),

    /// A node, function or syntax form with no translation rule.
    #[error("Unsupported construct: {construct} (in `{node}`)")]
    UnsupportedConstruct { construct: String, node: String },

    /// Structurally invalid use of a supported construct.
    #[error("Malformed expression: {message} (in `{node}`)")]
    MalformedExpression { message: String, node: String },
}

impl TranslateError {
    pub fn schema(message: impl Into<String>) -> Self {
        TranslateError::Schema(message.into())
    }

    pub fn unsupported(construct: impl Into<String>, node: impl ToString) -> Self {
        TranslateError::UnsupportedConstruct {
            construct: construct.into(),
            node: node.to_string(),
        }
    }

    pub fn malformed(message: impl Into<String>, node: impl ToString) -> Self {
        TranslateError::MalformedExpression {
            message: message.into(),
            node: node.to_string(),
        }
    }

    /// Short category label, used by `validate` and the CLI.
    pub fn kind(&self) -> &'static str {
        match self {
            TranslateError::Parse { .. } => "ParseError",
            TranslateError::Schema(_) => "SchemaError",
            TranslateError::UnsupportedConstruct { .. } => "UnsupportedConstructError",
            TranslateError::MalformedExpression { .. } => "MalformedExpressionError",
        }
    }
}

pub type Result<T> = std::result::Result<T, TranslateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TranslateError::unsupported("function $map", "$map(a, b)");
        assert_eq!(
            err.to_string(),
            "Unsupported construct: function $map (in `$map(a, b)`)"
        );
        assert_eq!(err.kind(), "UnsupportedConstructError");
    }

    #[test]
    fn test_schema_error_kind() {
        let err = TranslateError::schema("unknown table 'nope'");
        assert_eq!(err.kind(), "SchemaError");
        assert!(err.to_string().contains("nope"));
    }
}
