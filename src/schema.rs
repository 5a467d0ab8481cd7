//! Schema registry.
//!
//! Describes logical tables, their field→column mapping and declared
//! relations. `normalize_schema` is the only way to obtain a [`Schema`], so
//! every relation target is known to exist by the time translation runs.
use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TranslateError};

fn default_primary_key() -> String {
    "id".to_string()
}

/// Schema description as written in a schema file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawSchema {
    pub tables: BTreeMap<String, RawTable>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawTable {
    /// Physical table name; defaults to the logical name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, RawField>,
    #[serde(default)]
    pub relations: BTreeMap<String, RawRelation>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawField {
    /// Physical column; defaults to the slug.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub field_type: Option<FieldType>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawRelation {
    pub foreign_key: String,
    pub target_table: String,
    pub target_key: String,
}

/// Column value kind; decides how literals compared against it are encoded.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    Text,
    Number,
    Boolean,
    Timestamp,
    Json,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    tables: BTreeMap<String, TableDef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableDef {
    pub name: String,
    pub physical_name: String,
    pub primary_key: String,
    pub fields: BTreeMap<String, FieldDef>,
    pub relations: BTreeMap<String, Relation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub column: String,
    pub field_type: FieldType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    pub name: String,
    /// Column on the source table.
    pub foreign_key: String,
    pub target_table: String,
    /// Column on the target table.
    pub target_key: String,
    /// True when `target_key` is the target's primary key (at most one row).
    pub to_one: bool,
}

/// Validate a raw description and fill in defaults.
pub fn normalize_schema(raw: RawSchema) -> Result<Schema> {
    let primary_keys: BTreeMap<String, String> = raw
        .tables
        .iter()
        .map(|(name, t)| {
            (
                name.clone(),
                t.primary_key.clone().unwrap_or_else(default_primary_key),
            )
        })
        .collect();

    let mut tables = BTreeMap::new();
    for (name, raw_table) in raw.tables {
        let fields = raw_table
            .fields
            .into_iter()
            .map(|(slug, f)| {
                let column = f.column.unwrap_or_else(|| slug.clone());
                (
                    slug,
                    FieldDef {
                        column,
                        field_type: f.field_type.unwrap_or_default(),
                    },
                )
            })
            .collect();

        let mut relations = BTreeMap::new();
        for (rel_name, rel) in raw_table.relations {
            let target_pk = primary_keys.get(&rel.target_table).ok_or_else(|| {
                TranslateError::schema(format!(
                    "relation '{}.{}' targets unknown table '{}'",
                    name, rel_name, rel.target_table
                ))
            })?;
            if rel.foreign_key.is_empty() || rel.target_key.is_empty() {
                return Err(TranslateError::schema(format!(
                    "relation '{}.{}' must declare foreignKey and targetKey",
                    name, rel_name
                )));
            }
            let to_one = &rel.target_key == target_pk;
            relations.insert(
                rel_name.clone(),
                Relation {
                    name: rel_name,
                    foreign_key: rel.foreign_key,
                    target_table: rel.target_table,
                    target_key: rel.target_key,
                    to_one,
                },
            );
        }

        let physical_name = raw_table.table.unwrap_or_else(|| name.clone());
        let primary_key = raw_table.primary_key.unwrap_or_else(default_primary_key);
        tables.insert(
            name.clone(),
            TableDef {
                name,
                physical_name,
                primary_key,
                fields,
                relations,
            },
        );
    }

    Ok(Schema { tables })
}

impl Schema {
    pub fn table(&self, name: &str) -> Result<&TableDef> {
        self.tables
            .get(name)
            .ok_or_else(|| TranslateError::schema(format!("unknown table '{}'", name)))
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableDef> {
        self.tables.values()
    }

    /// Relation linking `outer` to `inner`, declared on either side.
    ///
    /// Returns the relation and whether it is declared on `outer`
    /// (`true`) or on `inner` pointing back at `outer` (`false`).
    pub fn relation_between(&self, outer: &str, inner: &str) -> Result<(&Relation, bool)> {
        let outer_def = self.table(outer)?;
        if let Some(rel) = outer_def
            .relations
            .values()
            .find(|r| r.target_table == inner)
        {
            return Ok((rel, true));
        }
        let inner_def = self.table(inner)?;
        inner_def
            .relations
            .values()
            .find(|r| r.target_table == outer)
            .map(|rel| (rel, false))
            .ok_or_else(|| {
                TranslateError::schema(format!(
                    "no relation declared between '{}' and '{}'",
                    outer, inner
                ))
            })
    }
}

impl TableDef {
    pub fn field(&self, slug: &str) -> Option<&FieldDef> {
        self.fields.get(slug)
    }

    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.get(name)
    }

    /// Column for a field slug; the primary key resolves even when undeclared.
    pub fn column(&self, slug: &str) -> Option<(String, FieldType)> {
        match self.fields.get(slug) {
            Some(f) => Some((f.column.clone(), f.field_type)),
            None if slug == self.primary_key => Some((self.primary_key.clone(), FieldType::Text)),
            None => None,
        }
    }
}

/// Load a schema description from a `.toml` or `.json` file.
pub fn load_schema_file(path: &Path) -> anyhow::Result<Schema> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read schema file: {}", path.display()))?;
    let raw: RawSchema = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON schema: {}", path.display()))?,
        _ => toml::from_str(&content)
            .with_context(|| format!("Invalid TOML schema: {}", path.display()))?,
    };
    Ok(normalize_schema(raw)?)
}

/// Schema used across the crate's tests: publications with stages, typed
/// attribute values and attribute definitions.
#[cfg(test)]
pub(crate) fn test_schema() -> Schema {
    let raw: RawSchema = toml::from_str(
        r#"
        [tables.pubs.fields]
        id = {}
        title = {}
        createdAt = { type = "timestamp" }
        stageId = {}
        score = { type = "number" }

        [tables.pubs.relations]
        stage = { foreignKey = "stageId", targetTable = "stages", targetKey = "id" }
        attrs = { foreignKey = "id", targetTable = "pub_values", targetKey = "pubId" }

        [tables.stages.fields]
        id = {}
        name = {}
        order = { type = "number" }

        [tables.pub_values.fields]
        id = {}
        pubId = {}
        fieldId = {}
        value = { type = "json" }

        [tables.pub_values.relations]
        attrDef = { foreignKey = "fieldId", targetTable = "pub_fields", targetKey = "id" }

        [tables.pub_fields.fields]
        id = {}
        slug = {}
        name = {}
        "#,
    )
    .expect("test schema parses");
    normalize_schema(raw).expect("test schema is valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_fills_defaults() {
        let schema = test_schema();
        let pubs = schema.table("pubs").unwrap();
        assert_eq!(pubs.physical_name, "pubs");
        assert_eq!(pubs.primary_key, "id");
        assert_eq!(pubs.field("title").unwrap().column, "title");
        assert_eq!(
            pubs.field("createdAt").unwrap().field_type,
            FieldType::Timestamp
        );
    }

    #[test]
    fn test_relation_cardinality() {
        let schema = test_schema();
        let pubs = schema.table("pubs").unwrap();
        assert!(pubs.relation("stage").unwrap().to_one);
        assert!(!pubs.relation("attrs").unwrap().to_one);
    }

    #[test]
    fn test_unknown_relation_target_rejected() {
        let raw: RawSchema = toml::from_str(
            r#"
            [tables.pubs.relations]
            stage = { foreignKey = "stageId", targetTable = "stages", targetKey = "id" }
            "#,
        )
        .unwrap();
        let err = normalize_schema(raw).unwrap_err();
        assert!(matches!(err, TranslateError::Schema(ref m) if m.contains("stages")));
    }

    #[test]
    fn test_physical_name_override() {
        let raw: RawSchema = serde_json::from_str(
            r#"{"tables": {"pubs": {"table": "pub_records", "fields": {"title": {"column": "pub_title"}}}}}"#,
        )
        .unwrap();
        let schema = normalize_schema(raw).unwrap();
        let pubs = schema.table("pubs").unwrap();
        assert_eq!(pubs.physical_name, "pub_records");
        assert_eq!(pubs.column("title").unwrap().0, "pub_title");
        assert_eq!(pubs.column("id").unwrap().0, "id");
        assert!(pubs.column("missing").is_none());
    }

    #[test]
    fn test_relation_between_either_side() {
        let schema = test_schema();
        let (rel, outer_side) = schema.relation_between("pubs", "stages").unwrap();
        assert_eq!(rel.name, "stage");
        assert!(outer_side);
        let (rel, outer_side) = schema.relation_between("stages", "pubs").unwrap();
        assert_eq!(rel.name, "stage");
        assert!(!outer_side);
        assert!(schema.relation_between("stages", "pub_fields").is_err());
    }

    #[test]
    fn test_unknown_table() {
        let schema = test_schema();
        assert!(matches!(
            schema.table("nope"),
            Err(TranslateError::Schema(_))
        ));
    }
}
