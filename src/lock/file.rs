//! File-backed lock slots
//!
//! Each slot is a pre-provisioned file `<prefix><n>` in a shared directory.
//! Only the advisory lock matters; file contents are never written.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;
use tracing::{debug, info};

use super::{LockProvider, LockSlot};
use crate::error::{LoaderError, Result};

/// Layout of the shared lock directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockDirectory {
    dir: PathBuf,
    prefix: String,
    slots: usize,
}

impl LockDirectory {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, slots: usize) -> Result<Self> {
        if slots == 0 {
            return Err(LoaderError::Configuration("lock directory needs at least one slot".into()));
        }
        Ok(Self {
            dir: dir.into(),
            prefix: prefix.into(),
            slots,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn slot_path(&self, slot: LockSlot) -> PathBuf {
        self.dir.join(format!("{}{}", self.prefix, slot))
    }

    /// Deployment helper: create the directory and its N lock files.
    /// Existing files are left untouched.
    pub fn provision(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|source| LoaderError::LockFile {
            path: self.dir.clone(),
            source,
        })?;
        for slot in 0..self.slots {
            let path = self.slot_path(slot);
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(|source| LoaderError::LockFile { path, source })?;
        }
        info!("Provisioned {} lock files in {}", self.slots, self.dir.display());
        Ok(())
    }
}

/// `LockProvider` over real files using `flock`-style advisory locks.
///
/// Every provider opens its own handles, so two providers in one process
/// contend with each other the same way two processes do.
pub struct FileLockProvider {
    layout: LockDirectory,
    held: Mutex<HashMap<LockSlot, File>>,
}

impl FileLockProvider {
    /// Fails if the directory is missing: that is a deployment problem,
    /// not contention.
    pub fn new(layout: LockDirectory) -> Result<Self> {
        if !layout.dir().is_dir() {
            return Err(LoaderError::Configuration(format!(
                "lock directory {} does not exist",
                layout.dir().display()
            )));
        }
        Ok(Self {
            layout,
            held: Mutex::new(HashMap::new()),
        })
    }

    pub fn layout(&self) -> &LockDirectory {
        &self.layout
    }

    fn open_slot(&self, slot: LockSlot) -> Result<File> {
        let path = self.layout.slot_path(slot);
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| LoaderError::LockFile { path, source })
    }
}

/// Lock already held elsewhere, or the platform refusing an overlapping lock
/// from this same process.
fn is_contention(err: &io::Error) -> bool {
    if err.kind() == fs2::lock_contended_error().kind() {
        return true;
    }
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::EDEADLK) {
        return true;
    }
    false
}

impl LockProvider for FileLockProvider {
    fn slot_count(&self) -> usize {
        self.layout.slots()
    }

    fn try_acquire(&self, slot: LockSlot) -> Result<bool> {
        let mut held = self.held.lock().map_err(|_| poisoned())?;
        if held.contains_key(&slot) {
            return Ok(false);
        }

        let file = self.open_slot(slot)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("Acquired lock slot {}", slot);
                held.insert(slot, file);
                Ok(true)
            }
            Err(e) if is_contention(&e) => Ok(false),
            Err(source) => Err(LoaderError::LockFile {
                path: self.layout.slot_path(slot),
                source,
            }),
        }
    }

    fn release(&self, slot: LockSlot) -> Result<()> {
        let file = self.held.lock().map_err(|_| poisoned())?.remove(&slot);
        if let Some(file) = file {
            // Dropping the handle releases the lock as well; unlock first so
            // the error, if any, is reported.
            file.unlock().map_err(|source| LoaderError::LockFile {
                path: self.layout.slot_path(slot),
                source,
            })?;
            debug!("Released lock slot {}", slot);
        }
        Ok(())
    }
}

fn poisoned() -> LoaderError {
    LoaderError::Configuration("lock handle table poisoned by a panicking holder".into())
}
