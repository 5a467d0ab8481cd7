use anyhow::{Context, Result};
use std::collections::BTreeMap;
use tokio_postgres::Client;
use tracing::info;

use crate::schema::{FieldType, RawField, RawRelation, RawSchema, RawTable};

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub table: String,
    pub name: String,
    pub data_type: String,
    pub is_primary_key: bool,
}

#[derive(Debug, Clone)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
    pub target_table: String,
    pub target_column: String,
}

pub async fn get_columns(client: &Client, schema: &str) -> Result<Vec<ColumnInfo>> {
    let rows = client
        .query(
            r#"
            SELECT
                c.table_name::text as table_name,
                c.column_name::text as name,
                c.data_type::text as data_type,
                COALESCE(tc.constraint_type = 'PRIMARY KEY', false) as is_primary_key
            FROM information_schema.columns c
            JOIN information_schema.tables t
                ON t.table_schema = c.table_schema
                AND t.table_name = c.table_name
                AND t.table_type IN ('BASE TABLE', 'VIEW')
            LEFT JOIN information_schema.key_column_usage kcu
                ON c.table_schema = kcu.table_schema
                AND c.table_name = kcu.table_name
                AND c.column_name = kcu.column_name
            LEFT JOIN information_schema.table_constraints tc
                ON kcu.constraint_name = tc.constraint_name
                AND kcu.table_schema = tc.table_schema
                AND tc.constraint_type = 'PRIMARY KEY'
            WHERE c.table_schema = $1
            ORDER BY c.table_name, c.ordinal_position
            "#,
            &[&schema],
        )
        .await
        .context("Failed to read columns")?;

    Ok(rows
        .iter()
        .map(|row| ColumnInfo {
            table: row.get("table_name"),
            name: row.get("name"),
            data_type: row.get("data_type"),
            is_primary_key: row.get("is_primary_key"),
        })
        .collect())
}

pub async fn get_foreign_keys(client: &Client, schema: &str) -> Result<Vec<ForeignKey>> {
    let rows = client
        .query(
            r#"
            SELECT
                kcu.table_name::text as table_name,
                kcu.column_name::text as column_name,
                ccu.table_name::text as target_table,
                ccu.column_name::text as target_column
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
            JOIN information_schema.constraint_column_usage ccu
                ON tc.constraint_name = ccu.constraint_name
                AND tc.table_schema = ccu.table_schema
            WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = $1
            ORDER BY kcu.table_name, kcu.column_name
            "#,
            &[&schema],
        )
        .await
        .context("Failed to read foreign keys")?;

    Ok(rows
        .iter()
        .map(|row| ForeignKey {
            table: row.get("table_name"),
            column: row.get("column_name"),
            target_table: row.get("target_table"),
            target_column: row.get("target_column"),
        })
        .collect())
}

/// Read a schema document for every table in `schema` from the catalog.
pub async fn introspect_schema(client: &Client, schema: &str) -> Result<RawSchema> {
    let columns = get_columns(client, schema).await?;
    let foreign_keys = get_foreign_keys(client, schema).await?;
    let raw = build_raw_schema(&columns, &foreign_keys);
    info!(
        schema,
        tables = raw.tables.len(),
        foreign_keys = foreign_keys.len(),
        "Introspected schema"
    );
    Ok(raw)
}

/// Map a PostgreSQL `data_type` onto a field type.
pub fn field_type_for(data_type: &str) -> FieldType {
    match data_type {
        "smallint" | "integer" | "bigint" | "numeric" | "real" | "double precision" => {
            FieldType::Number
        }
        "boolean" => FieldType::Boolean,
        "json" | "jsonb" => FieldType::Json,
        t if t.starts_with("timestamp") || t == "date" => FieldType::Timestamp,
        _ => FieldType::Text,
    }
}

/// `stageId` and `stage_id` name the relation `stage`; other columns fall
/// back to the target table name.
fn relation_name(fk: &ForeignKey) -> String {
    let column = fk.column.as_str();
    column
        .strip_suffix("_id")
        .or_else(|| column.strip_suffix("Id"))
        .filter(|stem| !stem.is_empty())
        .unwrap_or(&fk.target_table)
        .to_string()
}

/// Columns become fields keyed by column name. Every foreign key yields a
/// to-one relation on the referencing table and a to-many relation, named
/// after the referencing table, on the referenced one.
pub fn build_raw_schema(columns: &[ColumnInfo], foreign_keys: &[ForeignKey]) -> RawSchema {
    let mut tables: BTreeMap<String, RawTable> = BTreeMap::new();
    for col in columns {
        let table = tables.entry(col.table.clone()).or_default();
        if col.is_primary_key && table.primary_key.is_none() {
            table.primary_key = Some(col.name.clone());
        }
        table.fields.insert(
            col.name.clone(),
            RawField {
                column: None,
                field_type: Some(field_type_for(&col.data_type)),
            },
        );
    }

    for fk in foreign_keys {
        if !tables.contains_key(&fk.table) || !tables.contains_key(&fk.target_table) {
            continue;
        }
        let name = relation_name(fk);
        if let Some(table) = tables.get_mut(&fk.table) {
            table.relations.entry(name).or_insert_with(|| RawRelation {
                foreign_key: fk.column.clone(),
                target_table: fk.target_table.clone(),
                target_key: fk.target_column.clone(),
            });
        }
        if let Some(target) = tables.get_mut(&fk.target_table) {
            let inverse = if target.relations.contains_key(&fk.table) {
                format!("{}_by_{}", fk.table, fk.column)
            } else {
                fk.table.clone()
            };
            target.relations.entry(inverse).or_insert_with(|| RawRelation {
                foreign_key: fk.target_column.clone(),
                target_table: fk.table.clone(),
                target_key: fk.column.clone(),
            });
        }
    }

    RawSchema { tables }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::normalize_schema;

    fn column(table: &str, name: &str, data_type: &str, pk: bool) -> ColumnInfo {
        ColumnInfo {
            table: table.into(),
            name: name.into(),
            data_type: data_type.into(),
            is_primary_key: pk,
        }
    }

    fn catalog() -> (Vec<ColumnInfo>, Vec<ForeignKey>) {
        let columns = vec![
            column("pubs", "id", "text", true),
            column("pubs", "stageId", "text", false),
            column("pubs", "createdAt", "timestamp with time zone", false),
            column("stages", "id", "text", true),
            column("stages", "order", "integer", false),
            column("pub_values", "id", "text", true),
            column("pub_values", "pubId", "text", false),
            column("pub_values", "value", "jsonb", false),
        ];
        let foreign_keys = vec![
            ForeignKey {
                table: "pubs".into(),
                column: "stageId".into(),
                target_table: "stages".into(),
                target_column: "id".into(),
            },
            ForeignKey {
                table: "pub_values".into(),
                column: "pubId".into(),
                target_table: "pubs".into(),
                target_column: "id".into(),
            },
        ];
        (columns, foreign_keys)
    }

    #[test]
    fn test_field_type_mapping() {
        assert_eq!(field_type_for("bigint"), FieldType::Number);
        assert_eq!(field_type_for("timestamp without time zone"), FieldType::Timestamp);
        assert_eq!(field_type_for("jsonb"), FieldType::Json);
        assert_eq!(field_type_for("boolean"), FieldType::Boolean);
        assert_eq!(field_type_for("uuid"), FieldType::Text);
    }

    #[test]
    fn test_build_raw_schema_relations() {
        let (columns, foreign_keys) = catalog();
        let raw = build_raw_schema(&columns, &foreign_keys);

        let pubs = &raw.tables["pubs"];
        assert_eq!(pubs.primary_key.as_deref(), Some("id"));
        assert_eq!(pubs.relations["stage"].target_table, "stages");
        assert_eq!(pubs.relations["pub_values"].target_key, "pubId");
        assert_eq!(
            raw.tables["pub_values"].relations["pub"].foreign_key,
            "pubId"
        );

        let schema = normalize_schema(raw).unwrap();
        let pubs = schema.table("pubs").unwrap();
        assert!(pubs.relation("stage").unwrap().to_one);
        assert!(!pubs.relation("pub_values").unwrap().to_one);
        assert_eq!(
            pubs.column("createdAt"),
            Some(("createdAt".to_string(), FieldType::Timestamp))
        );
    }

    #[test]
    fn test_foreign_key_to_unknown_table_is_skipped() {
        let (columns, mut foreign_keys) = catalog();
        foreign_keys.push(ForeignKey {
            table: "pubs".into(),
            column: "communityId".into(),
            target_table: "communities".into(),
            target_column: "id".into(),
        });
        let raw = build_raw_schema(&columns, &foreign_keys);
        assert!(!raw.tables["pubs"].relations.contains_key("community"));
        assert!(normalize_schema(raw).is_ok());
    }
}
