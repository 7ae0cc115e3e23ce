//! Local store configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where the store keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// A database file on disk.
    File(PathBuf),
    /// A private in-memory database, discarded on close.
    Memory,
}

/// SQLite journal mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalMode {
    /// Write-ahead logging.
    Wal,
    /// Rollback journal deleted after each transaction.
    Delete,
    /// In-memory journal.
    Memory,
}

impl JournalMode {
    /// Returns the value for `PRAGMA journal_mode`.
    pub fn pragma_value(&self) -> &'static str {
        match self {
            JournalMode::Wal => "WAL",
            JournalMode::Delete => "DELETE",
            JournalMode::Memory => "MEMORY",
        }
    }
}

/// Configuration for opening a local store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database location.
    pub location: StoreLocation,

    /// How long a statement waits on a locked database file.
    pub busy_timeout: Duration,

    /// Journal mode for file-backed stores (in-memory stores ignore it).
    pub journal_mode: JournalMode,

    /// Capacity of the change-feed broadcast buffer.
    ///
    /// Subscribers that fall further behind observe a lag and refresh
    /// unconditionally.
    pub change_feed_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            location: StoreLocation::Memory,
            busy_timeout: Duration::from_secs(5),
            journal_mode: JournalMode::Wal,
            change_feed_capacity: 256,
        }
    }
}

impl StoreConfig {
    /// Creates a configuration for a database file.
    #[must_use]
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self {
            location: StoreLocation::File(path.as_ref().to_path_buf()),
            ..Self::default()
        }
    }

    /// Creates a configuration for an in-memory database.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Sets the busy timeout.
    #[must_use]
    pub const fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Sets the journal mode.
    #[must_use]
    pub const fn journal_mode(mut self, mode: JournalMode) -> Self {
        self.journal_mode = mode;
        self
    }

    /// Sets the change-feed capacity.
    #[must_use]
    pub const fn change_feed_capacity(mut self, capacity: usize) -> Self {
        self.change_feed_capacity = capacity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.location, StoreLocation::Memory);
        assert_eq!(config.journal_mode, JournalMode::Wal);
        assert_eq!(config.change_feed_capacity, 256);
    }

    #[test]
    fn builder_pattern() {
        let config = StoreConfig::file("tasks.db")
            .busy_timeout(Duration::from_millis(250))
            .journal_mode(JournalMode::Delete)
            .change_feed_capacity(8);

        assert_eq!(config.location, StoreLocation::File(PathBuf::from("tasks.db")));
        assert_eq!(config.busy_timeout, Duration::from_millis(250));
        assert_eq!(config.journal_mode.pragma_value(), "DELETE");
        assert_eq!(config.change_feed_capacity, 8);
    }
}
