//! Error types for the sync engine.

use std::path::PathBuf;
use thiserror::Error;
use tidesync_core::StoreError;
use tidesync_sync_protocol::{RemoteError, RemoteErrorKind};

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// None of these reach UI collaborators directly; the scheduler folds them
/// into the published status.
#[derive(Error, Debug)]
pub enum SyncError {
    /// No usable session could be obtained. The pass is aborted and the
    /// queue left untouched.
    #[error("credential error: {0}")]
    Credential(String),

    /// The remote refused one operation.
    #[error("remote rejected op {op_id} ({kind:?}): {message}")]
    RemoteRejected {
        /// Mutation-log operation id.
        op_id: i64,
        /// Classified rejection.
        kind: RemoteErrorKind,
        /// Detail from the backend.
        message: String,
    },

    /// The remote could not be reached.
    #[error("remote unreachable: {0}")]
    RemoteUnreachable(String),

    /// Local store failure during sync.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// An attempt exceeded its time budget.
    #[error("sync attempt timed out")]
    Timeout,

    /// Malformed response or request.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The scheduler was started outside a tokio runtime.
    #[error("no tokio runtime available")]
    NoRuntime,

    /// The scheduler task has exited.
    #[error("sync scheduler stopped")]
    Stopped,
}

impl SyncError {
    /// Creates a rejection error for an operation.
    pub fn rejected(op_id: i64, err: &RemoteError) -> Self {
        Self::RemoteRejected {
            op_id,
            kind: err.kind,
            message: err.message.clone(),
        }
    }

    /// Returns true if a later attempt may succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::RemoteUnreachable(_) | SyncError::Timeout => true,
            SyncError::RemoteRejected { kind, .. } => {
                matches!(kind, RemoteErrorKind::Server | RemoteErrorKind::Unreachable)
            }
            SyncError::Store(e) => e.is_storage_fault(),
            SyncError::Credential(_)
            | SyncError::Protocol(_)
            | SyncError::NoRuntime
            | SyncError::Stopped => false,
        }
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err.kind {
            RemoteErrorKind::Unreachable => SyncError::RemoteUnreachable(err.message),
            _ => SyncError::Protocol(err.to_string()),
        }
    }
}

/// Errors loading engine configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid configuration value: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::RemoteUnreachable("connection refused".into()).is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(!SyncError::Credential("refresh failed".into()).is_retryable());

        let server = RemoteError::new(RemoteErrorKind::Server, "500");
        assert!(SyncError::rejected(1, &server).is_retryable());
        let constraint = RemoteError::new(RemoteErrorKind::ConstraintViolation, "check");
        assert!(!SyncError::rejected(1, &constraint).is_retryable());
    }

    #[test]
    fn error_display() {
        let err = SyncError::rejected(42, &RemoteError::duplicate_key("exists"));
        let text = err.to_string();
        assert!(text.contains("42"));
        assert!(text.contains("DuplicateKey"));

        let err: SyncError = RemoteError::unreachable("dns").into();
        assert!(matches!(err, SyncError::RemoteUnreachable(_)));
    }
}
