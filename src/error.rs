//! Error types for the backup-butler library
//!
//! A single error enum covers every failure the core can produce. Per-file
//! errors (unreadable paths, hash failures, copy failures) are captured into
//! [`FileOutcome`](crate::types::FileOutcome) records at the task boundary and
//! never abort a run; fatal errors (unreachable roots, invalid configuration,
//! cancellation) propagate to the caller and map to a non-zero exit code.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the backup-butler library
pub type Result<T> = std::result::Result<T, BackupError>;

/// Main error type for all backup-butler operations
#[derive(Debug, Error)]
pub enum BackupError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Source or target root cannot be stat'd or created
    #[error("root unreachable: {path:?}: {message}")]
    RootUnreachable {
        /// The root that could not be reached
        path: PathBuf,
        /// Underlying failure description
        message: String,
    },

    /// Individual source entry cannot be stat'd or opened
    #[error("cannot read {path:?}: {message}")]
    PathUnreadable {
        /// Path that failed
        path: PathBuf,
        /// Underlying failure description
        message: String,
    },

    /// Digest computation failed mid-stream
    #[error("hash failed for {path:?}: {message}")]
    HashFailed {
        /// Path being hashed
        path: PathBuf,
        /// Underlying failure description
        message: String,
    },

    /// I/O failure during byte transfer
    #[error("copy failed: {source_path:?} -> {target_path:?}: {message}")]
    CopyFailed {
        /// Source of the transfer
        source_path: PathBuf,
        /// Destination of the transfer
        target_path: PathBuf,
        /// Underlying failure description
        message: String,
    },

    /// Post-copy hash mismatch
    #[error("verification failed for {path:?}: expected {expected}, actual {actual}")]
    VerifyFailed {
        /// Destination that failed verification
        path: PathBuf,
        /// Hash of the source content
        expected: String,
        /// Hash computed over the destination
        actual: String,
    },

    /// Cooperative cancellation observed
    #[error("operation cancelled")]
    Cancelled,

    /// Journal index or version file cannot be parsed
    #[error("journal corrupt: {0}")]
    JournalCorrupt(String),

    /// Requested run record does not exist
    #[error("run not found: {0}")]
    RunNotFound(String),

    /// Generic error for unexpected conditions
    #[error("internal error: {0}")]
    Internal(String),
}

impl BackupError {
    /// Create a configuration error with a custom message
    pub fn config(msg: impl Into<String>) -> Self {
        BackupError::ConfigInvalid(msg.into())
    }

    /// Create a root-unreachable error from an underlying failure
    pub fn root(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        BackupError::RootUnreachable {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Create a per-file unreadable-path error
    pub fn unreadable(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        BackupError::PathUnreadable {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Create a hash-failure error
    pub fn hash(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        BackupError::HashFailed {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Create a copy-failure error
    pub fn copy(
        source_path: impl Into<PathBuf>,
        target_path: impl Into<PathBuf>,
        err: impl std::fmt::Display,
    ) -> Self {
        BackupError::CopyFailed {
            source_path: source_path.into(),
            target_path: target_path.into(),
            message: err.to_string(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        BackupError::Internal(msg.into())
    }

    /// Check if this error aborts the whole run
    ///
    /// Fatal errors map to exit code 1; everything else is captured into a
    /// per-file outcome and the run continues.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BackupError::ConfigInvalid(_)
                | BackupError::RootUnreachable { .. }
                | BackupError::Cancelled
        )
    }

    /// Check if this error is the cooperative-cancellation signal
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BackupError::Cancelled)
    }

    /// Check if this error should trigger a copy retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackupError::Io(_) | BackupError::CopyFailed { .. } | BackupError::VerifyFailed { .. }
        )
    }
}
