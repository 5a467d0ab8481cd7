//! Domain adapter for publication filters.
//!
//! Sits above the generic translator: expands the `attrs.slug` shorthand,
//! turns attribute-bag access into EXISTS subqueries over the value and
//! definition tables, and compiles filter expressions into fragments that
//! are spliced into statements the caller owns.
mod filter;
mod shorthand;

pub use filter::{compile_filter, CompiledFilter, DomainAdapter};
pub use shorthand::Shorthand;

use serde::{Deserialize, Serialize};

/// Names of the tables, relations and fields the adapter works with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DomainConfig {
    /// Logical table filters apply to.
    pub root_table: String,
    /// Relation from the root table to attribute values; also the
    /// shorthand prefix.
    pub attributes: String,
    /// Relation from an attribute value to its definition.
    pub definition: String,
    /// Field of the definition table holding the slug.
    pub slug_field: String,
    /// Field of the value table holding the JSON value.
    pub value_field: String,
    /// Root-table fields a filter may reference directly. `None` allows
    /// every field of the schema.
    pub filterable_fields: Option<Vec<String>>,
}

impl Default for DomainConfig {
    fn default() -> Self {
        DomainConfig {
            root_table: String::from("pubs"),
            attributes: String::from("attrs"),
            definition: String::from("attrDef"),
            slug_field: String::from("slug"),
            value_field: String::from("value"),
            filterable_fields: None,
        }
    }
}

impl DomainConfig {
    pub fn allows_field(&self, field: &str) -> bool {
        self.filterable_fields
            .as_ref()
            .map_or(true, |fields| fields.iter().any(|f| f == field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_fill_missing_keys() {
        let config: DomainConfig =
            toml::from_str("rootTable = 'items'\nfilterableFields = ['id', 'title']").unwrap();
        assert_eq!(config.root_table, "items");
        assert_eq!(config.attributes, "attrs");
        assert!(config.allows_field("title"));
        assert!(!config.allows_field("score"));
        assert!(DomainConfig::default().allows_field("score"));
    }
}
