//! SQL plumbing: named statement templates and the execution capability.

pub mod executor;
pub mod templates;

pub use executor::{BatchStatement, SqlExecutor, SqlRow, SqliteExecutor};
pub use templates::{QuerySource, TemplateRegistry};
