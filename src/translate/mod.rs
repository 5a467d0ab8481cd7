//! Expression → SQL translation.
//!
//! ```text
//! ExprNode ──► Translator (expr.rs) ──► TranslationResult (result.rs)
//!                 │   ▲
//!                 ▼   │
//!         path.rs / joins.rs / functions.rs
//! ```
//!
//! The translator is a single recursive dispatch; paths are folded into a
//! [`PathAcc`] and turned into joins, EXISTS subqueries, JSON arrays or full
//! statements depending on the [`TranslationMode`] they appear in.
pub mod context;
pub mod expr;
pub mod functions;
pub mod joins;
pub mod path;
pub mod result;

pub use context::{AliasGenerator, Context, TableScope, TranslationMode};
pub use expr::{Params, Translator};
pub use functions::{
    functions_by_tier, lookup_function, Aggregate, FunctionSpec, SupportTier, FUNCTIONS,
};
pub use joins::{JoinSet, JoinSpec};
pub use path::{PathAcc, PathRole, Projection, Window};
pub use result::TranslationResult;
