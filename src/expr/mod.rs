/// Expression front end: AST contract, lexer and parser.
///
/// ```text
/// Input text
///       ↓
/// Lexer       (lexer.rs)
///       ↓
/// Parser      (parser.rs, memoized by text)
///       ↓
/// ExprNode    (ast.rs)
/// ```
pub mod ast;
pub mod lexer;
pub mod parser;

pub use ast::*;
pub use parser::{parse, parse_uncached};
