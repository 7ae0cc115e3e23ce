//! Error types for TideSync core.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in local store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying SQLite database failed. The statement had no effect.
    #[error("storage fault: {0}")]
    Storage(#[from] rusqlite::Error),

    /// A payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The on-disk schema differs from the one the store was opened with.
    #[error("schema mismatch: {message}")]
    SchemaMismatch {
        /// Description of the mismatch.
        message: String,
    },

    /// Entity not found.
    #[error("entity not found: {id} in table {table}")]
    EntityNotFound {
        /// Table searched.
        table: String,
        /// Entity id that was not found.
        id: String,
    },

    /// An argument was rejected before touching storage.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Why the argument is invalid.
        message: String,
    },

    /// A stored value did not have the expected shape.
    #[error("corrupt row in {table}: {message}")]
    CorruptRow {
        /// Table the row came from.
        table: String,
        /// Description of the problem.
        message: String,
    },
}

impl StoreError {
    /// Creates a schema mismatch error.
    pub fn schema_mismatch(message: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            message: message.into(),
        }
    }

    /// Creates an entity-not-found error.
    pub fn not_found(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self::EntityNotFound {
            table: table.into(),
            id: id.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a corrupt row error.
    pub fn corrupt_row(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CorruptRow {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Returns true if this is a storage-level fault rather than a caller error.
    pub fn is_storage_fault(&self) -> bool {
        matches!(self, StoreError::Storage(_))
    }
}

/// Terminal errors delivered by a query subscription.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WatchError {
    /// The watched query failed to execute.
    #[error("subscription fault for `{sql}`: {message}")]
    Query {
        /// The query text.
        sql: String,
        /// Failure description.
        message: String,
    },

    /// Subscriptions need a tokio runtime to refresh in the background.
    #[error("no tokio runtime available to drive the subscription")]
    NoRuntime,
}

impl WatchError {
    /// Creates a query failure.
    pub fn query(sql: impl Into<String>, err: &StoreError) -> Self {
        Self::Query {
            sql: sql.into(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_fault_classification() {
        let err = StoreError::from(rusqlite::Error::InvalidQuery);
        assert!(err.is_storage_fault());
        assert!(err.to_string().starts_with("storage fault"));

        assert!(!StoreError::not_found("tasks", "x").is_storage_fault());
    }

    #[test]
    fn error_display() {
        let err = StoreError::not_found("tasks", "abc");
        assert_eq!(err.to_string(), "entity not found: abc in table tasks");

        let err = WatchError::query("SELECT 1", &StoreError::invalid_argument("bad"));
        assert!(err.to_string().contains("SELECT 1"));
        assert!(err.to_string().contains("bad"));
    }
}
