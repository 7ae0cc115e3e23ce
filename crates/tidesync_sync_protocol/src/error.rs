//! Structured remote errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for remote operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Classified reason a remote write did not apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// A row with the same id already exists.
    DuplicateKey,
    /// The write matched no rows.
    NoRowsAffected,
    /// Some other constraint rejected the write.
    ConstraintViolation,
    /// The table is missing or the caller lacks permission on it.
    TableUnavailable,
    /// The backend failed internally.
    Server,
    /// The backend could not be reached at all.
    Unreachable,
}

impl RemoteErrorKind {
    /// Classifies a raw HTTP response.
    ///
    /// `code` is the backend's structured error code when the body carried
    /// one (Postgres SQLSTATE codes such as `23505`).
    pub fn classify(status: u16, code: Option<&str>) -> Self {
        if let Some(code) = code {
            match code {
                "23505" => return RemoteErrorKind::DuplicateKey,
                "42P01" | "42501" | "PGRST205" => return RemoteErrorKind::TableUnavailable,
                c if c.starts_with("23") => return RemoteErrorKind::ConstraintViolation,
                _ => {}
            }
        }

        match status {
            401 | 403 | 404 => RemoteErrorKind::TableUnavailable,
            409 => RemoteErrorKind::DuplicateKey,
            400..=499 => RemoteErrorKind::ConstraintViolation,
            _ => RemoteErrorKind::Server,
        }
    }

    /// Returns true if the rejection concerns the whole table rather than
    /// a single row.
    pub fn is_table_level(&self) -> bool {
        matches!(self, RemoteErrorKind::TableUnavailable)
    }

    /// Returns true if the failure happened below the protocol layer.
    pub fn is_transport(&self) -> bool {
        matches!(self, RemoteErrorKind::Unreachable)
    }
}

/// An error reported by (or on the way to) the remote backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct RemoteError {
    /// Classified kind.
    pub kind: RemoteErrorKind,
    /// Human-readable detail, for logs only.
    pub message: String,
}

impl RemoteError {
    /// Creates a remote error.
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates a duplicate-key error.
    pub fn duplicate_key(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::DuplicateKey, message)
    }

    /// Creates a no-rows-affected error.
    pub fn no_rows(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::NoRowsAffected, message)
    }

    /// Creates a table-unavailable error.
    pub fn table_unavailable(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::TableUnavailable, message)
    }

    /// Creates an unreachable error.
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Unreachable, message)
    }
}

/// Error body returned by PostgREST-style backends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireErrorBody {
    /// Structured error code.
    #[serde(default)]
    pub code: Option<String>,
    /// Error message.
    #[serde(default)]
    pub message: Option<String>,
    /// Extra detail.
    #[serde(default)]
    pub details: Option<String>,
    /// Remediation hint.
    #[serde(default)]
    pub hint: Option<String>,
}

impl WireErrorBody {
    /// Parses an error body, tolerating non-JSON payloads.
    pub fn parse(bytes: &[u8]) -> Self {
        serde_json::from_slice(bytes).unwrap_or_else(|_| WireErrorBody {
            message: Some(String::from_utf8_lossy(bytes).into_owned()),
            ..Default::default()
        })
    }

    /// Converts the body into a classified error.
    pub fn into_error(self, status: u16) -> RemoteError {
        let kind = RemoteErrorKind::classify(status, self.code.as_deref());
        let message = match (self.message, self.details) {
            (Some(m), Some(d)) => format!("{m} ({d})"),
            (Some(m), None) => m,
            (None, Some(d)) => d,
            (None, None) => format!("HTTP {status}"),
        };
        RemoteError::new(kind, message)
    }
}
