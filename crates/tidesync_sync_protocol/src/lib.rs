//! # TideSync Sync Protocol
//!
//! Remote wire contract types for TideSync.
//!
//! This crate provides:
//! - `RemoteOperation` for the three per-table writes (upsert, update, delete)
//! - `RemoteError` / `RemoteErrorKind`, the structured rejection taxonomy
//! - `Session` and `Credentials` for bearer-token authentication
//!
//! This is a pure protocol crate with no I/O operations. Transports map
//! their raw responses into these types exactly once, at the boundary, so
//! that nothing downstream needs to inspect error message text.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod operation;
mod session;

pub use error::{RemoteError, RemoteErrorKind, RemoteResult, WireErrorBody};
pub use operation::{RemoteOpKind, RemoteOperation};
pub use session::{Credentials, Session};
