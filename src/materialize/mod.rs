//! Materialization
//!
//! Turns flat query rows into domain objects (`aggregator`) and makes
//! objects reachable from several collections share one instance
//! (`interner`). `operons` wires both into a concrete pipeline.

pub mod aggregator;
pub mod interner;
pub mod operons;

pub use aggregator::{FnAggregator, Grouping, ListGrouping, RowAggregator, SetGrouping, SortedSetGrouping};
pub use interner::{
    intern_groups, CanonicalTable, GroupedCollections, GroupedMaterializer, RedundancyInterner, SharedCanonicalTable,
};
pub use operons::{OperonLoader, OperonTranscripts, StableIdStamping, TranscriptRows};
