//! Loader configuration
//!
//! Read from a YAML file or from `GENOME_LOADER_*` environment variables
//! (a `.env` file is honoured). Every field has a default.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::batch::Batcher;
use crate::ids::StableIdFormatter;
use crate::lock::{BackoffPolicy, LockDirectory};
use crate::sql::TemplateRegistry;

const ENV_PREFIX: &str = "GENOME_LOADER_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// SQLite file holding the identifier table.
    pub database_path: PathBuf,
    /// Directory of pre-provisioned lock files.
    pub lock_dir: PathBuf,
    pub lock_prefix: String,
    /// Number of lock files. Only `1` keeps separate processes out of each
    /// other's critical sections; more slots bound cross-process
    /// concurrency to that number instead.
    pub lock_slots: usize,
    /// Accession stem, e.g. `EB` in `EBG00000000042`.
    pub stem: String,
    /// Optional YAML file overriding or adding SQL templates.
    pub templates_path: Option<PathBuf>,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub batch_size: usize,
    /// Skip the lock arbiter because the store's insert + read-back is
    /// atomic in this deployment.
    pub atomic_store: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("stable_ids.db"),
            lock_dir: PathBuf::from("locks"),
            lock_prefix: "stable_id.lock.".to_string(),
            lock_slots: 1,
            stem: "EB".to_string(),
            templates_path: None,
            backoff_initial_ms: 5,
            backoff_max_ms: 250,
            batch_size: 500,
            atomic_store: false,
        }
    }
}

impl LoaderConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read loader config {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&yaml)
            .with_context(|| format!("Failed to parse loader config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `GENOME_LOADER_*` variables.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Same as `from_env` with an explicit variable lookup.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(&format!("{}{}", ENV_PREFIX, key));
        let mut config = Self::default();

        if let Some(v) = var("DATABASE_PATH") {
            config.database_path = v.into();
        }
        if let Some(v) = var("LOCK_DIR") {
            config.lock_dir = v.into();
        }
        if let Some(v) = var("LOCK_PREFIX") {
            config.lock_prefix = v;
        }
        if let Some(v) = var("LOCK_SLOTS") {
            config.lock_slots = parse_var("LOCK_SLOTS", &v)?;
        }
        if let Some(v) = var("STEM") {
            config.stem = v;
        }
        if let Some(v) = var("TEMPLATES_PATH") {
            config.templates_path = Some(v.into());
        }
        if let Some(v) = var("BACKOFF_INITIAL_MS") {
            config.backoff_initial_ms = parse_var("BACKOFF_INITIAL_MS", &v)?;
        }
        if let Some(v) = var("BACKOFF_MAX_MS") {
            config.backoff_max_ms = parse_var("BACKOFF_MAX_MS", &v)?;
        }
        if let Some(v) = var("BATCH_SIZE") {
            config.batch_size = parse_var("BATCH_SIZE", &v)?;
        }
        if let Some(v) = var("ATOMIC_STORE") {
            config.atomic_store = parse_var("ATOMIC_STORE", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lock_slots == 0 {
            bail!("lock_slots must be at least 1");
        }
        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        if self.stem.is_empty() {
            bail!("stem must not be empty");
        }
        if self.backoff_initial_ms > self.backoff_max_ms {
            bail!(
                "backoff_initial_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_initial_ms,
                self.backoff_max_ms
            );
        }
        Ok(())
    }

    pub fn lock_directory(&self) -> Result<LockDirectory> {
        Ok(LockDirectory::new(&self.lock_dir, &self.lock_prefix, self.lock_slots)?)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff_initial_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    pub fn formatter(&self) -> Result<StableIdFormatter> {
        Ok(StableIdFormatter::new(&self.stem)?)
    }

    pub fn batcher(&self) -> Result<Batcher> {
        Ok(Batcher::new(self.batch_size)?)
    }

    /// Builtin templates, overridden by `templates_path` when set.
    pub fn templates(&self) -> Result<TemplateRegistry> {
        let mut registry = TemplateRegistry::builtin();
        if let Some(path) = &self.templates_path {
            registry.merge(TemplateRegistry::from_yaml_file(path)?);
        }
        Ok(registry)
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {}{}: '{}'", ENV_PREFIX, key, value))
}
