//! # TideSync Sync Engine
//!
//! Uploads the local mutation log to a remote backend.
//!
//! This crate provides:
//! - `Connector`, which drains the mutation log with idempotent recovery rules
//! - `SyncHandle`, a background scheduler with exponential backoff and an
//!   offline toggle
//! - `CredentialSource` implementations (static and HTTP)
//! - `RemoteBackend` implementations (PostgREST-style HTTP and in-memory)
//! - `EngineConfig`, loaded from TOML
//!
//! ## Architecture
//!
//! The engine is **upload-only**: local writes are authoritative until the
//! remote confirms them, and nothing is pulled back.
//! 1. Local writes append to the mutation log inside their own transaction
//! 2. The scheduler wakes (timer, `sync_now`, or going online)
//! 3. The connector applies pending entries in operation-id order
//! 4. Confirmed entries are removed from the log
//!
//! ## Key Invariants
//!
//! - At most one upload pass is in flight
//! - Entries for one entity are applied in enqueue order
//! - An entry is removed only after the remote confirmed it
//! - Offline mode never contacts the credential source or remote
//! - Sync failures only surface through `SyncStatus`

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connector;
mod credentials;
mod error;
mod http;
mod remote;
mod scheduler;

pub use config::{Backoff, BackoffConfig, BackoffSection, EngineConfig, SyncConfig, SyncSection};
pub use connector::{Connector, UploadReport};
pub use credentials::{CredentialSource, HttpCredentialSource, StaticCredentials};
pub use error::{ConfigError, SyncError, SyncResult};
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, ReqwestClient, RestBackend};
pub use remote::{MemoryRemote, RemoteBackend};
pub use scheduler::{SyncHandle, SyncOutcome, SyncPhase, SyncStatus};
