//! Stable Identifiers
//!
//! Entity types that carry an accession-style stable identifier, the
//! formatter that renders them, the store that persists their sequence
//! values, and the allocator tying those together.

pub mod allocator;
pub mod format;
pub mod store;

pub use allocator::{AllocatedId, IdAllocator};
pub use format::{StableIdFormatter, StableIdentifier};
pub use store::{IdentifierRecord, IdentifierStore, InMemoryIdentifierStore, SqliteIdentifierStore};

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::LoaderError;

/// Entity types that receive stable identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum EntityType {
    Gene,
    Transcript,
    Translation,
    Repeat,
    Exon,
}

impl EntityType {
    pub const ALL: [EntityType; 5] = [
        EntityType::Gene,
        EntityType::Transcript,
        EntityType::Translation,
        EntityType::Repeat,
        EntityType::Exon,
    ];

    /// One-letter tag placed between the stem and the sequence value.
    pub fn tag(self) -> &'static str {
        match self {
            EntityType::Gene => "G",
            EntityType::Transcript => "T",
            EntityType::Translation => "P",
            EntityType::Repeat => "R",
            EntityType::Exon => "E",
        }
    }

    /// Value stored in the identifier table's type column.
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Gene => "gene",
            EntityType::Transcript => "transcript",
            EntityType::Translation => "translation",
            EntityType::Repeat => "repeat",
            EntityType::Exon => "exon",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.tag() == tag)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = LoaderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| LoaderError::Integrity(format!("unknown entity type '{}'", s)))
    }
}

/// Kinds of domain feature the loader assembles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureKind {
    Gene,
    Transcript,
    Translation,
    RepeatRegion,
    Exon,
    Operon,
    ProteinFeature,
}

/// Closed mapping from feature kind to identifier type. Kinds that never
/// carry a stable identifier fail instead of falling back to "no type".
impl TryFrom<FeatureKind> for EntityType {
    type Error = LoaderError;

    fn try_from(kind: FeatureKind) -> Result<Self, Self::Error> {
        match kind {
            FeatureKind::Gene => Ok(EntityType::Gene),
            FeatureKind::Transcript => Ok(EntityType::Transcript),
            FeatureKind::Translation => Ok(EntityType::Translation),
            FeatureKind::RepeatRegion => Ok(EntityType::Repeat),
            FeatureKind::Exon => Ok(EntityType::Exon),
            FeatureKind::Operon | FeatureKind::ProteinFeature => Err(LoaderError::UntypedFeature(kind)),
        }
    }
}

/// Domain objects that know which kind of feature they are.
pub trait StableIdentified {
    fn feature_kind(&self) -> FeatureKind;

    fn entity_type(&self) -> Result<EntityType, LoaderError> {
        EntityType::try_from(self.feature_kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_distinct() {
        let mut tags: Vec<_> = EntityType::ALL.iter().map(|t| t.tag()).collect();
        tags.sort();
        tags.dedup();
        assert_eq!(tags.len(), EntityType::ALL.len());
    }

    #[test]
    fn test_round_trip_names_and_tags() {
        for ty in EntityType::ALL {
            assert_eq!(ty.as_str().parse::<EntityType>().unwrap(), ty);
            assert_eq!(EntityType::from_tag(ty.tag()), Some(ty));
        }
        assert!("operon".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_feature_mapping_is_total_and_loud() {
        assert_eq!(EntityType::try_from(FeatureKind::RepeatRegion).unwrap(), EntityType::Repeat);
        let err = EntityType::try_from(FeatureKind::Operon).unwrap_err();
        assert!(matches!(err, LoaderError::UntypedFeature(FeatureKind::Operon)));
    }
}
