//! Domain objects assembled by the operon pipeline.
//!
//! Only the slice of the genome model the identity layer touches.

use std::sync::Arc;

use crate::ids::{FeatureKind, StableIdentified, StableIdentifier};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exon {
    pub exon_id: i64,
    pub rank: u32,
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub transcript_id: i64,
    /// Placeholder key the identifier store allocates against.
    pub raw_key: String,
    pub stable_id: Option<StableIdentifier>,
    /// Ordered by rank.
    pub exons: Vec<Exon>,
}

impl Transcript {
    pub fn new(transcript_id: i64, raw_key: impl Into<String>) -> Self {
        Self {
            transcript_id,
            raw_key: raw_key.into(),
            stable_id: None,
            exons: Vec::new(),
        }
    }

    pub fn with_stable_id(mut self, stable_id: StableIdentifier) -> Self {
        self.stable_id = Some(stable_id);
        self
    }
}

/// Operons share transcripts: the same `Arc` appears under every operon
/// that reaches it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operon {
    pub operon_id: i64,
    pub transcripts: Vec<Arc<Transcript>>,
}

impl StableIdentified for Exon {
    fn feature_kind(&self) -> FeatureKind {
        FeatureKind::Exon
    }
}

impl StableIdentified for Transcript {
    fn feature_kind(&self) -> FeatureKind {
        FeatureKind::Transcript
    }
}

impl StableIdentified for Operon {
    fn feature_kind(&self) -> FeatureKind {
        FeatureKind::Operon
    }
}
