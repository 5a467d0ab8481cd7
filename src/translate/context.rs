//! Translation context.
//!
//! `Context` is a small value: translating a sibling expression takes a
//! clone, and relation traversal moves a local copy to the target table.
//! Nothing a subexpression does to its own copy is visible to the caller.
//! State that must be shared across siblings (the alias counter and the
//! pending joins of the statement being built) lives on the translator.
use std::collections::HashMap;

use super::result::TranslationResult;
use crate::error::{Result, TranslateError};

/// What the expression being translated will become. Decides the shape of
/// relation and nested-table translations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationMode {
    /// Top-level expression that is not a table path.
    Root,
    /// A boolean condition headed for WHERE: relation comparisons become
    /// EXISTS subqueries.
    Filter,
    /// A select-list value: collections become JSON arrays.
    Projection,
    /// An ORDER BY term.
    Order,
    /// A value computed inside a nested statement.
    Subquery,
}

impl TranslationMode {
    pub fn is_filter(self) -> bool {
        self == TranslationMode::Filter
    }

    /// Whether a collection may be materialized as a JSON array here.
    pub fn allows_collections(self) -> bool {
        matches!(
            self,
            TranslationMode::Root | TranslationMode::Projection | TranslationMode::Subquery
        )
    }
}

/// The table rows are currently resolved against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableScope {
    /// Logical table name.
    pub table: String,
    pub alias: String,
}

impl TableScope {
    pub fn new(table: impl Into<String>, alias: impl Into<String>) -> Self {
        TableScope {
            table: table.into(),
            alias: alias.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Context {
    pub current: Option<TableScope>,
    pub mode: TranslationMode,
    /// Flat variable bindings; later binds shadow earlier ones.
    pub bindings: HashMap<String, TranslationResult>,
    /// Statement nesting level; 0 is the outermost statement.
    pub depth: usize,
}

impl Context {
    /// Context for a top-level expression with no table in scope.
    pub fn root() -> Self {
        Context {
            current: None,
            mode: TranslationMode::Root,
            bindings: HashMap::new(),
            depth: 0,
        }
    }

    pub fn for_table(table: impl Into<String>, alias: impl Into<String>) -> Self {
        Context {
            current: Some(TableScope::new(table, alias)),
            ..Context::root()
        }
    }

    pub fn with_mode(&self, mode: TranslationMode) -> Self {
        Context {
            mode,
            ..self.clone()
        }
    }

    /// Same statement, rows resolved against another table.
    pub fn at(&self, scope: TableScope) -> Self {
        Context {
            current: Some(scope),
            ..self.clone()
        }
    }

    /// Context for the body of a nested statement over `scope`.
    pub fn nested(&self, scope: TableScope, mode: TranslationMode) -> Self {
        Context {
            current: Some(scope),
            mode,
            bindings: self.bindings.clone(),
            depth: self.depth + 1,
        }
    }

    pub fn bind(&mut self, name: impl Into<String>, value: TranslationResult) {
        self.bindings.insert(name.into(), value);
    }

    pub fn binding(&self, name: &str) -> Option<&TranslationResult> {
        self.bindings.get(name)
    }

    /// The table in scope, or an error naming what needed one.
    pub fn scope(&self, needed_by: &str) -> Result<&TableScope> {
        self.current.as_ref().ok_or_else(|| {
            TranslateError::schema(format!(
                "'{}' must be used inside a table path such as $$table[...]",
                needed_by
            ))
        })
    }
}

/// Monotonic alias source; one per compile, so aliases never repeat.
#[derive(Debug, Clone)]
pub struct AliasGenerator {
    prefix: String,
    next: usize,
}

impl AliasGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        AliasGenerator {
            prefix: prefix.into(),
            next: 0,
        }
    }

    pub fn generate(&mut self) -> String {
        let alias = format!("{}{}", self.prefix, self.next);
        self.next += 1;
        alias
    }

    /// Every alias handed out so far, in order.
    pub fn issued(&self) -> Vec<String> {
        (0..self.next)
            .map(|i| format!("{}{}", self.prefix, i))
            .collect()
    }
}

impl Default for AliasGenerator {
    fn default() -> Self {
        AliasGenerator::new("t")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::Literal;

    #[test]
    fn test_alias_generator_is_monotonic() {
        let mut aliases = AliasGenerator::default();
        assert_eq!(aliases.generate(), "t0");
        assert_eq!(aliases.generate(), "t1");
        assert_eq!(aliases.issued(), vec!["t0", "t1"]);

        let mut filters = AliasGenerator::new("f");
        assert_eq!(filters.generate(), "f0");
    }

    #[test]
    fn test_moving_a_copy_leaves_original() {
        let ctx = Context::for_table("pubs", "t0");
        let moved = ctx.at(TableScope::new("stages", "t1"));
        assert_eq!(moved.current.as_ref().unwrap().alias, "t1");
        assert_eq!(ctx.current.as_ref().unwrap().alias, "t0");
    }

    #[test]
    fn test_nested_increments_depth() {
        let mut ctx = Context::for_table("pubs", "t0");
        ctx.bind("x", TranslationResult::Literal(Literal::Integer(1)));
        let inner = ctx.nested(TableScope::new("stages", "t1"), TranslationMode::Subquery);
        assert_eq!(inner.depth, 1);
        assert_eq!(inner.mode, TranslationMode::Subquery);
        assert!(inner.binding("x").is_some());
    }

    #[test]
    fn test_scope_required() {
        let err = Context::root().scope("title").unwrap_err();
        assert_eq!(err.kind(), "SchemaError");
        assert!(Context::for_table("pubs", "t0").scope("title").is_ok());
    }

    #[test]
    fn test_mode_predicates() {
        assert!(TranslationMode::Filter.is_filter());
        assert!(!TranslationMode::Filter.allows_collections());
        assert!(TranslationMode::Projection.allows_collections());
        assert!(!TranslationMode::Order.allows_collections());
    }
}
