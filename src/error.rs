//! Error taxonomy for sweeps and their collaborators.
use crate::model::SweepKind;
use crate::storage::StorageError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by sweep controllers, the reconciliation engine and the
/// request surface.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("a {0} sweep is already active")]
    AlreadyRunning(SweepKind),
    #[error("{0} sweep is not running")]
    NotRunning(SweepKind),
    #[error("{0} sweep is not paused")]
    NotPaused(SweepKind),
    #[error("{kind} sweep state changed concurrently (expected version {expected})")]
    StateConflict { kind: SweepKind, expected: i64 },
    #[error("remote listing failed: {0}")]
    ScanFailure(String),
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    #[error("configuration error: {0}")]
    PermanentConfiguration(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SweepError {
    /// Whether a driver may retry the same call after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SweepError::TransientNetwork(_) | SweepError::StateConflict { .. }
        )
    }
}

impl From<StorageError> for SweepError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Transient(msg) => SweepError::TransientNetwork(msg),
            StorageError::NotConfigured(msg) | StorageError::Unauthorized(msg) => {
                SweepError::PermanentConfiguration(msg)
            }
            other => SweepError::Internal(anyhow::Error::new(other)),
        }
    }
}

/// Per-item failure: recorded against the item, never fatal to the sweep.
#[derive(Debug, Error)]
pub enum ItemProcessingError {
    #[error("local file missing: {}", .0.display())]
    LocalFileMissing(PathBuf),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("optimizer: {0}")]
    Optimizer(String),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_onto_taxonomy() {
        let err: SweepError = StorageError::Transient("503".into()).into();
        assert!(err.is_transient());

        let err: SweepError = StorageError::NotConfigured("no endpoint".into()).into();
        assert!(matches!(err, SweepError::PermanentConfiguration(_)));
        assert!(!err.is_transient());

        assert!(!SweepError::AlreadyRunning(SweepKind::Migration).is_transient());
        assert!(SweepError::StateConflict {
            kind: SweepKind::Migration,
            expected: 3
        }
        .is_transient());
    }
}
