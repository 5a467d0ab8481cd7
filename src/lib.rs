pub mod db;
pub mod domain;
pub mod error;
pub mod expr;
pub mod query;
pub mod schema;
pub mod sql;
pub mod translate;
pub mod validate;

pub use domain::{compile_filter, CompiledFilter, DomainAdapter, DomainConfig};
pub use error::{Result, TranslateError};
pub use expr::parse;
pub use query::{compile, CompiledQuery, Compiler, QueryParts};
pub use schema::{load_schema_file, normalize_schema, RawSchema, Schema};
pub use translate::Params;
pub use validate::{validate, ValidationReport};
