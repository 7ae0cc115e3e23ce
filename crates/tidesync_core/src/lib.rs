//! # TideSync Core
//!
//! Local store, mutation log and reactive queries for TideSync.
//!
//! This crate provides:
//! - `LocalStore`, an SQLite-backed store with serialized statement execution
//! - An implicit mutation log maintained by triggers on every synced table
//! - A change feed fired after each committed write
//! - Reactive query subscriptions (`LocalStore::watch`)
//! - Typed task services (`TaskService`)
//!
//! ## Key Invariants
//!
//! - A write to a synced table and its mutation-log entry commit together
//! - Mutation-log operation ids increase in enqueue order
//! - Entity ids are immutable once assigned
//! - Watchers re-run after every commit touching a table they read

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_feed;
mod config;
mod error;
mod id;
mod oplog;
mod schema;
mod store;
mod tasks;
mod value;
mod watcher;

pub use change_feed::{ChangeEvent, ChangeFeed};
pub use config::{JournalMode, StoreConfig, StoreLocation};
pub use error::{StoreError, StoreResult, WatchError};
pub use id::EntityId;
pub use oplog::{MutationKind, PendingMutation, MUTATION_LOG_TABLE};
pub use schema::{ColumnDef, ColumnType, Schema, TableDef, SCHEMA_FORMAT_VERSION};
pub use store::{LocalStore, StoreTransaction};
pub use tasks::{
    now_millis, tasks_from, NewTask, Priority, Task, TaskPatch, TaskService, OPEN_TASKS_SQL,
    TASKS_TABLE,
};
pub use value::{QueryResult, RowRef, SqlValue};
pub use watcher::QueryStream;
