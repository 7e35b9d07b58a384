//! Stable identifier rendering: `stem + tag + 11-digit sequence value`.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::EntityType;
use crate::error::{LoaderError, Result};

pub const SEQUENCE_DIGITS: usize = 11;
const MAX_SEQUENCE: u64 = 99_999_999_999;

/// Externally visible accession string, e.g. `EBG00000000042`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StableIdentifier(String);

impl StableIdentifier {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for StableIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StableIdentifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StableIdFormatter {
    stem: String,
}

impl StableIdFormatter {
    pub fn new(stem: impl Into<String>) -> Result<Self> {
        let stem = stem.into();
        if stem.is_empty() || !stem.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(LoaderError::Configuration(format!(
                "stable identifier stem must be non-empty ASCII letters, got '{}'",
                stem
            )));
        }
        Ok(Self { stem })
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    /// Values that do not fit in 11 digits are refused rather than widened,
    /// so every identifier parses back unambiguously.
    pub fn format(&self, entity: EntityType, sequence_value: i64) -> Result<StableIdentifier> {
        let value = u64::try_from(sequence_value)
            .ok()
            .filter(|v| *v <= MAX_SEQUENCE)
            .ok_or_else(|| {
                LoaderError::Integrity(format!(
                    "sequence value {} for {} does not fit {} digits",
                    sequence_value, entity, SEQUENCE_DIGITS
                ))
            })?;
        Ok(StableIdentifier(format!(
            "{}{}{:0width$}",
            self.stem,
            entity.tag(),
            value,
            width = SEQUENCE_DIGITS
        )))
    }

    /// Inverse of `format` for identifiers carrying this formatter's stem.
    pub fn parse(&self, id: &str) -> Option<(EntityType, i64)> {
        let rest = id.strip_prefix(self.stem.as_str())?;
        if rest.len() != 1 + SEQUENCE_DIGITS || !rest.is_char_boundary(1) {
            return None;
        }
        let (tag, digits) = rest.split_at(1);
        let entity = EntityType::from_tag(tag)?;
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().map(|value| (entity, value))
    }
}

impl Default for StableIdFormatter {
    fn default() -> Self {
        Self { stem: "EB".to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gene_42() {
        let formatter = StableIdFormatter::new("EB").unwrap();
        let id = formatter.format(EntityType::Gene, 42).unwrap();
        assert_eq!(id.as_str(), "EBG00000000042");
    }

    #[test]
    fn test_each_type_uses_its_tag() {
        let formatter = StableIdFormatter::default();
        assert_eq!(formatter.format(EntityType::Transcript, 1).unwrap().as_str(), "EBT00000000001");
        assert_eq!(formatter.format(EntityType::Translation, 7).unwrap().as_str(), "EBP00000000007");
        assert_eq!(formatter.format(EntityType::Exon, 99_999_999_999).unwrap().as_str(), "EBE99999999999");
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let formatter = StableIdFormatter::default();
        assert!(formatter.format(EntityType::Repeat, 100_000_000_000).is_err());
        assert!(formatter.format(EntityType::Repeat, -1).is_err());
    }

    #[test]
    fn test_parse_inverts_format() {
        let formatter = StableIdFormatter::new("ENS").unwrap();
        let id = formatter.format(EntityType::Repeat, 1234).unwrap();
        assert_eq!(formatter.parse(id.as_str()), Some((EntityType::Repeat, 1234)));

        assert_eq!(formatter.parse("EBG00000000042"), None);
        assert_eq!(formatter.parse("ENSX00000000042"), None);
        assert_eq!(formatter.parse("ENSG0000000042"), None);
    }

    #[test]
    fn test_bad_stem_rejected() {
        assert!(StableIdFormatter::new("").is_err());
        assert!(StableIdFormatter::new("E1").is_err());
    }
}
