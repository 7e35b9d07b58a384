//! Loader Errors
//!
//! One error type for the identity layer. Variants follow the failure
//! categories callers have to tell apart: configuration mistakes and integrity
//! violations abort the run, transient store failures may be retried by
//! whoever owns the retry policy.

use std::io;
use std::path::PathBuf;

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::ids::FeatureKind;

pub type Result<T, E = LoaderError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("cannot open lock file {path}: {source}")]
    LockFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no SQL template named '{0}'")]
    MissingTemplate(String),

    #[error("SQL template '{name}' references parameter {{{index}}} which was not supplied")]
    TemplateParameter { name: String, index: usize },

    #[error("schema provisioning failed: {0}")]
    Schema(#[source] rusqlite::Error),

    /// Busy, locked or timed-out store. Safe to retry from outside.
    #[error("transient data access failure: {0}")]
    Transient(#[source] rusqlite::Error),

    #[error("data access failure: {0}")]
    DataAccess(#[source] rusqlite::Error),

    #[error("data integrity violation: {0}")]
    Integrity(String),

    #[error("feature kind {0:?} has no stable identifier type")]
    UntypedFeature(FeatureKind),
}

impl LoaderError {
    /// True for failures a caller may retry with its own backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, LoaderError::Transient(_))
    }

    /// True for failures that should abort the enclosing materialization run.
    pub fn is_fatal(&self) -> bool {
        !self.is_transient()
    }
}

impl From<rusqlite::Error> for LoaderError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => LoaderError::Transient(err),
            _ => LoaderError::DataAccess(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn test_busy_and_locked_are_transient() {
        let busy: LoaderError = sqlite_failure(rusqlite::ffi::SQLITE_BUSY).into();
        let locked: LoaderError = sqlite_failure(rusqlite::ffi::SQLITE_LOCKED).into();
        assert!(busy.is_transient());
        assert!(locked.is_transient());
    }

    #[test]
    fn test_other_store_errors_are_permanent() {
        let constraint: LoaderError = sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT).into();
        assert!(matches!(constraint, LoaderError::DataAccess(_)));
        assert!(constraint.is_fatal());

        let missing = LoaderError::Integrity("row vanished".into());
        assert!(missing.is_fatal());
    }
}
