//! Identity layer wiring
//!
//! Builds executor, templates, identifier store, lock arbiter and
//! allocator from a `LoaderConfig`.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::LoaderConfig;
use crate::ids::{IdAllocator, IdentifierStore, SqliteIdentifierStore};
use crate::lock::LockArbiter;
use crate::materialize::{OperonLoader, OperonTranscripts};
use crate::sql::{QuerySource, SqlExecutor, SqliteExecutor};

pub struct IdentityLayer {
    config: LoaderConfig,
    executor: Arc<dyn SqlExecutor>,
    templates: Arc<dyn QuerySource>,
    store: Arc<SqliteIdentifierStore>,
}

impl IdentityLayer {
    /// Opens the database. Lock files are only touched once an allocator
    /// is requested.
    pub fn open(config: LoaderConfig) -> Result<Self> {
        config.validate()?;
        let executor: Arc<dyn SqlExecutor> = Arc::new(
            SqliteExecutor::open(&config.database_path)
                .with_context(|| format!("Failed to open identifier database {}", config.database_path.display()))?,
        );
        let templates: Arc<dyn QuerySource> = Arc::new(config.templates()?);
        let store = Arc::new(
            SqliteIdentifierStore::new(executor.clone(), templates.clone()).with_atomic_upsert(config.atomic_store),
        );
        Ok(Self {
            config,
            executor,
            templates,
            store,
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Create lock files and the identifier table. `clean` drops existing
    /// allocations.
    pub fn provision(&self, clean: bool) -> Result<()> {
        self.config
            .lock_directory()?
            .provision()
            .context("Failed to provision lock directory")?;
        self.store.provision(clean).context("Failed to provision identifier table")?;
        info!("Identity layer provisioned at {}", self.config.database_path.display());
        Ok(())
    }

    pub fn allocator(&self) -> Result<IdAllocator> {
        let arbiter = if self.store.is_atomic() {
            None
        } else {
            let layout = self.config.lock_directory()?;
            Some(LockArbiter::for_directory(layout)?.with_backoff(self.config.backoff()))
        };
        Ok(IdAllocator::new(self.store.clone(), self.config.formatter()?, arbiter)?)
    }

    pub fn operon_loader(&self) -> Result<OperonLoader> {
        let materializer = OperonTranscripts::new(self.executor.clone(), self.templates.clone(), self.config.batcher()?);
        Ok(OperonLoader::new(materializer, self.allocator()?))
    }
}
