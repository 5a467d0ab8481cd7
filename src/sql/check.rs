/// Syntax check of emitted SQL.
///
/// Runs generated text back through `sqlparser`'s PostgreSQL dialect. Used by
/// the CLI's `--check` flag and by tests, never on the translation hot path.
use anyhow::{anyhow, Result};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser as SqlParser;

/// Parse `sql` and return the number of statements it contains.
pub fn check_sql(sql: &str) -> Result<usize> {
    let dialect = PostgreSqlDialect {};
    let statements =
        SqlParser::parse_sql(&dialect, sql).map_err(|e| anyhow!("SQL parse error: {}", e))?;
    if statements.is_empty() {
        return Err(anyhow!("No SQL statement produced"));
    }
    Ok(statements.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_accepts_parameterized_select() {
        let sql = "SELECT t0.* FROM pubs AS t0 WHERE t0.title = $1 AND \"t0\".\"createdAt\" > $2 LIMIT 1";
        assert_eq!(check_sql(sql).unwrap(), 1);
    }

    #[test]
    fn test_check_accepts_jsonb_cast_and_exists() {
        let sql = "SELECT * FROM pubs AS t0 WHERE EXISTS (SELECT 1 FROM pub_values AS f1 \
                   WHERE f1.\"pubId\" = t0.id AND f1.value = $1::jsonb)";
        assert!(check_sql(sql).is_ok());
    }

    #[test]
    fn test_check_rejects_garbage() {
        assert!(check_sql("SELECT (1 FROM pubs").is_err());
        assert!(check_sql("").is_err());
    }
}
