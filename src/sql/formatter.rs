/// SQL pretty-printer.
///
/// Shares the compiler's walker and only changes layout: one clause per line,
/// multi-item projection lists broken across lines, and nested subqueries
/// indented one level deeper than their enclosing statement.
use super::compiler::SqlWriter;
use super::types::{Literal, SelectQuery};

const INDENT: &str = "    ";

/// Pretty-print a statement with literals inlined.
pub fn format_sql(select: &SelectQuery) -> String {
    SqlWriter::inline().pretty().select(select)
}

/// Pretty-print a statement with literals bound as positional parameters.
pub fn format_sql_parameterized(select: &SelectQuery) -> (String, Vec<Literal>) {
    let mut writer = SqlWriter::parameterized().pretty();
    let sql = writer.select(select);
    (sql, writer.into_params())
}

fn indent(level: usize) -> String {
    INDENT.repeat(level)
}

pub(crate) fn join_clauses(parts: &[String], depth: usize) -> String {
    let prefix = indent(depth);
    parts
        .iter()
        .map(|p| format!("{}{}", prefix, p))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Projection list as it follows the `SELECT` keyword: on the same line for
/// a single item, one item per line otherwise.
pub(crate) fn join_select_items(items: &[String], depth: usize) -> String {
    if items.len() <= 1 {
        return format!(" {}", items.join(", "));
    }
    let prefix = format!("{}{}", indent(depth), INDENT);
    let lines: Vec<String> = items.iter().map(|i| format!("{}{}", prefix, i)).collect();
    format!("\n{}", lines.join(",\n"))
}

/// `body` is already indented at `depth + 1`.
pub(crate) fn wrap_nested(body: &str, depth: usize) -> String {
    format!("(\n{}\n{})", body, indent(depth))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::types::*;

    #[test]
    fn test_format_simple_select() {
        let mut q = SelectQuery::from_table("pubs", "t0");
        q.projections.push(SelectItem::QualifiedWildcard("t0".into()));
        assert_eq!(format_sql(&q), "SELECT t0.*\nFROM pubs AS t0");
    }

    #[test]
    fn test_format_multicolumn_select() {
        let mut q = SelectQuery::from_table("pubs", "t0");
        for name in ["id", "title"] {
            q.projections.push(SelectItem::Expression {
                expr: Expression::column("t0", name),
                alias: Some(name.into()),
            });
        }
        q.limit = Some(1);
        assert_eq!(
            format_sql(&q),
            "SELECT\n    t0.id AS id,\n    t0.title AS title\nFROM pubs AS t0\nLIMIT 1"
        );
        assert!(format_sql(&q).lines().all(|line| !line.ends_with(' ')));
    }

    #[test]
    fn test_format_subquery_indents() {
        let mut inner = SelectQuery::from_table("stages", "t1");
        inner.projections.push(SelectItem::Expression {
            expr: Expression::Raw("1".into()),
            alias: None,
        });
        let mut q = SelectQuery::from_table("pubs", "t0");
        q.and_where(Expression::Exists(Box::new(inner)));
        assert_eq!(
            format_sql(&q),
            "SELECT *\nFROM pubs AS t0\nWHERE EXISTS (\n    SELECT 1\n    FROM stages AS t1\n)"
        );
    }

    #[test]
    fn test_format_parameterized_matches_compact_params() {
        let mut q = SelectQuery::from_table("pubs", "t0");
        q.and_where(Expression::binary(
            Expression::column("t0", "title"),
            BinaryOperator::Eq,
            Expression::string("x"),
        ));
        let (pretty, params) = format_sql_parameterized(&q);
        let (_, compact_params) = crate::sql::compiler::compile_parameterized(&q);
        assert!(pretty.contains("WHERE t0.title = $1"));
        assert_eq!(params, compact_params);
    }
}
