//! Genome Loader Identity Layer
//!
//! The parts of the annotation loader that keep identity straight:
//! - Cross-process lock arbiter over file-based lock slots
//! - Stable identifier allocation backed by a relational table
//! - Row aggregation into domain objects
//! - Interning of objects reachable from several collections

pub mod batch;
pub mod config;
pub mod domain;
pub mod error;
pub mod ids;
pub mod layer;
pub mod lock;
pub mod materialize;
pub mod sql;

// Re-exports for convenience
pub use config::LoaderConfig;
pub use error::{LoaderError, Result};
pub use ids::{EntityType, IdAllocator, StableIdFormatter, StableIdentifier};
pub use layer::IdentityLayer;
pub use lock::LockArbiter;
pub use materialize::{RedundancyInterner, RowAggregator};
