//! Identifier Store
//!
//! Durable mapping `(raw_key, entity_type) -> sequence_value`. Rows are only
//! ever inserted; the store's uniqueness constraint arbitrates concurrent
//! inserts of the same key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rusqlite::types::Value;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::EntityType;
use crate::error::{LoaderError, Result};
use crate::sql::templates::{
    STABLE_ID_CREATE, STABLE_ID_DROP, STABLE_ID_INSERT_IGNORE, STABLE_ID_SELECT, STABLE_ID_SELECT_ALL,
};
use crate::sql::{QuerySource, SqlExecutor};

pub const DEFAULT_TABLE: &str = "stable_id";

/// One persisted identifier row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierRecord {
    pub raw_key: String,
    pub entity_type: EntityType,
    pub sequence_value: i64,
}

pub trait IdentifierStore: Send + Sync {
    /// Create the table. With `clean`, drop and recreate it first; this
    /// destroys every allocation and is meant for test/reset workflows only.
    fn provision(&self, clean: bool) -> Result<()>;

    /// Insert `(raw_key, entity)` unless it exists; a conflict is a no-op.
    fn insert_if_absent(&self, entity: EntityType, raw_key: &str) -> Result<()>;

    fn sequence_value(&self, entity: EntityType, raw_key: &str) -> Result<Option<i64>>;

    fn records(&self) -> Result<Vec<IdentifierRecord>>;

    /// Whether insert-if-absent followed by read-back is atomic on its own.
    /// Stores answering `false` need the lock arbiter around allocation.
    fn is_atomic(&self) -> bool;
}

/// Identifier table behind a `SqlExecutor`, statements from a `QuerySource`.
pub struct SqliteIdentifierStore {
    executor: Arc<dyn SqlExecutor>,
    templates: Arc<dyn QuerySource>,
    table: String,
    atomic: bool,
}

impl SqliteIdentifierStore {
    pub fn new(executor: Arc<dyn SqlExecutor>, templates: Arc<dyn QuerySource>) -> Self {
        Self {
            executor,
            templates,
            table: DEFAULT_TABLE.to_string(),
            atomic: false,
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Declare that this deployment's backend makes insert + read-back
    /// atomic, so allocation can skip the external lock.
    pub fn with_atomic_upsert(mut self, atomic: bool) -> Self {
        self.atomic = atomic;
        self
    }

    fn statement(&self, name: &str) -> Result<String> {
        self.templates.get_query_with(name, &[self.table.as_str()])
    }

    fn key_params(entity: EntityType, raw_key: &str) -> [Value; 2] {
        [Value::Text(raw_key.to_string()), Value::Text(entity.as_str().to_string())]
    }
}

impl IdentifierStore for SqliteIdentifierStore {
    fn provision(&self, clean: bool) -> Result<()> {
        if clean {
            warn!("Dropping identifier table '{}' before provisioning", self.table);
            let drop = self.statement(STABLE_ID_DROP)?;
            self.executor.execute_statement(&drop).map_err(into_schema_error)?;
        }
        let create = self.statement(STABLE_ID_CREATE)?;
        self.executor.execute_statement(&create).map_err(into_schema_error)?;
        info!("Identifier table '{}' ready", self.table);
        Ok(())
    }

    fn insert_if_absent(&self, entity: EntityType, raw_key: &str) -> Result<()> {
        let sql = self.statement(STABLE_ID_INSERT_IGNORE)?;
        self.executor.execute(&sql, &Self::key_params(entity, raw_key))?;
        Ok(())
    }

    fn sequence_value(&self, entity: EntityType, raw_key: &str) -> Result<Option<i64>> {
        let sql = self.statement(STABLE_ID_SELECT)?;
        match self.executor.query_scalar(&sql, &Self::key_params(entity, raw_key))? {
            None => Ok(None),
            Some(Value::Integer(v)) => Ok(Some(v)),
            Some(other) => Err(LoaderError::Integrity(format!(
                "sequence value for {} '{}' is not an integer: {:?}",
                entity, raw_key, other
            ))),
        }
    }

    fn records(&self) -> Result<Vec<IdentifierRecord>> {
        let sql = self.statement(STABLE_ID_SELECT_ALL)?;
        self.executor
            .query_rows(&sql, &[])?
            .into_iter()
            .map(|row| -> Result<IdentifierRecord> {
                Ok(IdentifierRecord {
                    raw_key: row.get(0)?,
                    entity_type: row.get::<String>(1)?.parse()?,
                    sequence_value: row.get(2)?,
                })
            })
            .collect()
    }

    fn is_atomic(&self) -> bool {
        self.atomic
    }
}

fn into_schema_error(err: LoaderError) -> LoaderError {
    match err {
        LoaderError::DataAccess(e) | LoaderError::Transient(e) => LoaderError::Schema(e),
        other => other,
    }
}

#[derive(Default)]
struct MemoryState {
    rows: HashMap<(EntityType, String), i64>,
    last_value: i64,
    busy_failures: u32,
}

/// In-process store with the same allocate-or-reuse contract. Insert and
/// read-back happen under one mutex, so it is atomic.
#[derive(Default, Clone)]
pub struct InMemoryIdentifierStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryIdentifierStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` inserts fail with a transient busy error.
    pub fn inject_busy_failures(&self, count: u32) -> Result<()> {
        self.lock()?.busy_failures = count;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| LoaderError::Configuration("in-memory identifier store poisoned".into()))
    }
}

impl IdentifierStore for InMemoryIdentifierStore {
    fn provision(&self, clean: bool) -> Result<()> {
        if clean {
            let mut state = self.lock()?;
            state.rows.clear();
            state.last_value = 0;
        }
        Ok(())
    }

    fn insert_if_absent(&self, entity: EntityType, raw_key: &str) -> Result<()> {
        let mut state = self.lock()?;
        if state.busy_failures > 0 {
            state.busy_failures -= 1;
            return Err(LoaderError::Transient(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                Some("injected busy failure".into()),
            )));
        }
        let key = (entity, raw_key.to_string());
        if !state.rows.contains_key(&key) {
            state.last_value += 1;
            let value = state.last_value;
            state.rows.insert(key, value);
        }
        Ok(())
    }

    fn sequence_value(&self, entity: EntityType, raw_key: &str) -> Result<Option<i64>> {
        Ok(self.lock()?.rows.get(&(entity, raw_key.to_string())).copied())
    }

    fn records(&self) -> Result<Vec<IdentifierRecord>> {
        let state = self.lock()?;
        let mut records: Vec<_> = state
            .rows
            .iter()
            .map(|((entity, raw_key), value)| IdentifierRecord {
                raw_key: raw_key.clone(),
                entity_type: *entity,
                sequence_value: *value,
            })
            .collect();
        records.sort_by_key(|r| r.sequence_value);
        Ok(records)
    }

    fn is_atomic(&self) -> bool {
        true
    }
}
