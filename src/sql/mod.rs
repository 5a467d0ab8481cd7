/// Statement layer: the SQL AST the translator emits and everything that
/// renders or transforms it.
///
/// ```text
/// translate::* ──► SelectQuery (types.rs)
///                     │
///          Rewriter (rewrite.rs)
///                     │
///        ┌────────────┴────────────┐
///   compiler.rs                formatter.rs
///  (compact text)             (pretty text)
///                     │
///        check.rs (sqlparser round trip)
/// ```
pub mod check;
pub mod compiler;
pub mod formatter;
pub mod rewrite;
pub mod types;

pub use check::check_sql;
pub use compiler::{compile, compile_expr, compile_parameterized, quote_ident};
pub use formatter::{format_sql, format_sql_parameterized};
pub use rewrite::{RenameAlias, RewritePass, Rewriter};
pub use types::*;
