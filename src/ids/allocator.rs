//! Allocate-or-reuse of stable identifiers.
//!
//! 1. insert `(raw_key, type)` if absent, letting the store's unique
//!    constraint absorb races on brand-new keys;
//! 2. read the sequence value back;
//! 3. format it.
//!
//! Steps 1-2 run inside the lock arbiter unless the store says they are
//! atomic on their own. Every call is idempotent, so a caller that sees a
//! transient error can simply call again.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{EntityType, IdentifierStore, StableIdFormatter, StableIdentified, StableIdentifier};
use crate::error::{LoaderError, Result};
use crate::lock::LockArbiter;

/// Result of one allocation, as reported to the rest of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedId {
    pub raw_key: String,
    pub entity_type: EntityType,
    pub stable_id: StableIdentifier,
}

#[derive(Clone)]
pub struct IdAllocator {
    store: Arc<dyn IdentifierStore>,
    arbiter: Option<LockArbiter>,
    formatter: StableIdFormatter,
}

impl IdAllocator {
    /// A store that is not atomic on its own must come with an arbiter.
    pub fn new(store: Arc<dyn IdentifierStore>, formatter: StableIdFormatter, arbiter: Option<LockArbiter>) -> Result<Self> {
        if arbiter.is_none() && !store.is_atomic() {
            return Err(LoaderError::Configuration(
                "identifier store is not atomic and no lock arbiter was configured".into(),
            ));
        }
        Ok(Self { store, arbiter, formatter })
    }

    pub fn formatter(&self) -> &StableIdFormatter {
        &self.formatter
    }

    pub fn store(&self) -> &Arc<dyn IdentifierStore> {
        &self.store
    }

    pub fn allocate(&self, entity: EntityType, raw_key: &str) -> Result<StableIdentifier> {
        let value = self.guarded(|| self.insert_and_read(entity, raw_key))?;
        let id = self.formatter.format(entity, value)?;
        debug!("Allocated {} for {} '{}'", id, entity, raw_key);
        Ok(id)
    }

    /// Allocate for a domain object, deriving the type from its feature kind.
    pub fn allocate_for<F: StableIdentified + ?Sized>(&self, feature: &F, raw_key: &str) -> Result<StableIdentifier> {
        self.allocate(feature.entity_type()?, raw_key)
    }

    /// Allocate several keys of one type under a single lock acquisition.
    /// Output order follows `raw_keys`.
    pub fn allocate_all<S: AsRef<str>>(&self, entity: EntityType, raw_keys: &[S]) -> Result<Vec<AllocatedId>> {
        let values = self.guarded(|| {
            raw_keys
                .iter()
                .map(|key| self.insert_and_read(entity, key.as_ref()))
                .collect::<Result<Vec<_>>>()
        })?;

        raw_keys
            .iter()
            .zip(values)
            .map(|(key, value)| -> Result<AllocatedId> {
                Ok(AllocatedId {
                    raw_key: key.as_ref().to_string(),
                    entity_type: entity,
                    stable_id: self.formatter.format(entity, value)?,
                })
            })
            .collect()
    }

    /// Read-only lookup; `None` if the key was never allocated.
    pub fn resolve(&self, entity: EntityType, raw_key: &str) -> Result<Option<StableIdentifier>> {
        self.store
            .sequence_value(entity, raw_key)?
            .map(|value| self.formatter.format(entity, value))
            .transpose()
    }

    fn insert_and_read(&self, entity: EntityType, raw_key: &str) -> Result<i64> {
        self.store.insert_if_absent(entity, raw_key)?;
        self.store.sequence_value(entity, raw_key)?.ok_or_else(|| {
            LoaderError::Integrity(format!(
                "no sequence value for {} '{}' after insert; identifier table schema mismatch?",
                entity, raw_key
            ))
        })
    }

    fn guarded<T>(&self, step: impl FnOnce() -> Result<T>) -> Result<T> {
        match &self.arbiter {
            Some(arbiter) => arbiter.run_exclusively(step)?,
            None => step(),
        }
    }
}
