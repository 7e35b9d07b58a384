//! SQL Template Registry
//!
//! Named SQL statements with ordinal `{0}`, `{1}`, ... placeholders that are
//! filled by plain string replacement before execution.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{LoaderError, Result};

/// Lookup of named statement templates.
pub trait QuerySource: Send + Sync {
    fn get_query(&self, name: &str) -> Result<&str>;

    /// Template `name` with `{i}` replaced by `params[i]`.
    fn get_query_with(&self, name: &str, params: &[&str]) -> Result<String> {
        let template = self.get_query(name)?;
        substitute(name, template, params)
    }
}

/// Replace every `{i}` placeholder. A placeholder without a matching
/// parameter is an error; unused parameters are ignored.
pub fn substitute(name: &str, template: &str, params: &[&str]) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}');
        let ordinal = close.and_then(|c| after[..c].parse::<usize>().ok().map(|i| (i, c)));

        match ordinal {
            Some((index, close)) => {
                let value = params.get(index).ok_or_else(|| LoaderError::TemplateParameter {
                    name: name.to_string(),
                    index,
                })?;
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                // Not a placeholder; keep the brace literally.
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

/// Name → statement map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateRegistry {
    templates: HashMap<String, String>,
}

pub const STABLE_ID_CREATE: &str = "stable_id.create";
pub const STABLE_ID_DROP: &str = "stable_id.drop";
pub const STABLE_ID_INSERT_IGNORE: &str = "stable_id.insert_ignore";
pub const STABLE_ID_SELECT: &str = "stable_id.select";
pub const STABLE_ID_SELECT_ALL: &str = "stable_id.select_all";
pub const OPERON_TRANSCRIPTS: &str = "operon.transcripts";

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statements the identity layer needs, written for SQLite.
    /// `{0}` is the identifier table name.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.insert(
            STABLE_ID_CREATE,
            "CREATE TABLE IF NOT EXISTS {0} (
                sequence_value INTEGER PRIMARY KEY AUTOINCREMENT,
                raw_key TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                UNIQUE (raw_key, entity_type)
            )",
        );
        registry.insert(STABLE_ID_DROP, "DROP TABLE IF EXISTS {0}");
        registry.insert(
            STABLE_ID_INSERT_IGNORE,
            "INSERT OR IGNORE INTO {0} (raw_key, entity_type) VALUES (?1, ?2)",
        );
        registry.insert(
            STABLE_ID_SELECT,
            "SELECT sequence_value FROM {0} WHERE raw_key = ?1 AND entity_type = ?2",
        );
        registry.insert(
            STABLE_ID_SELECT_ALL,
            "SELECT raw_key, entity_type, sequence_value FROM {0} ORDER BY sequence_value",
        );
        // {0} is an IN-list of operon ids.
        registry.insert(
            OPERON_TRANSCRIPTS,
            "SELECT o.operon_id, t.transcript_id, t.raw_key, e.exon_id, e.exon_rank, e.seq_start, e.seq_end
             FROM operon_transcript o
             JOIN transcript t ON t.transcript_id = o.transcript_id
             JOIN exon e ON e.transcript_id = t.transcript_id
             WHERE o.operon_id IN ({0})
             ORDER BY o.operon_id, o.position, t.transcript_id, e.exon_rank",
        );
        registry
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse SQL template YAML")
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read SQL templates from {}", path.display()))?;
        Self::from_yaml_str(&yaml)
    }

    pub fn insert(&mut self, name: impl Into<String>, statement: impl Into<String>) {
        self.templates.insert(name.into(), statement.into());
    }

    /// Entries in `other` replace entries with the same name.
    pub fn merge(&mut self, other: TemplateRegistry) {
        self.templates.extend(other.templates);
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl QuerySource for TemplateRegistry {
    fn get_query(&self, name: &str) -> Result<&str> {
        self.templates
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| LoaderError::MissingTemplate(name.to_string()))
    }
}
