//! CLI command implementations.

pub mod pending;
pub mod sync;
pub mod tasks;
pub mod watch;

use tidesync_core::{LocalStore, TaskService};
use tidesync_sync_engine::EngineConfig;

/// Result type for commands.
pub type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// Configuration shared by every command.
pub struct Context {
    /// Loaded configuration, with command-line overrides applied.
    pub config: EngineConfig,
}

impl Context {
    /// Creates a context.
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Opens the local store, creating the database file if needed.
    pub fn open_store(&self) -> CliResult<LocalStore> {
        Ok(LocalStore::open_file(
            &self.config.database,
            TaskService::schema(),
        )?)
    }

    /// Opens the task service.
    pub fn tasks(&self) -> CliResult<TaskService> {
        Ok(TaskService::new(self.open_store()?)?)
    }
}
