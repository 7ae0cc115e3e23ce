//! Sessions and request credentials.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An authenticated session issued by the credential source.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Bearer token.
    pub access_token: String,
    /// Token used to obtain a fresh session, if the source issued one.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Expiry in seconds since the Unix epoch.
    pub expires_at: i64,
}

impl Session {
    /// Creates a session.
    pub fn new(access_token: impl Into<String>, expires_at: i64) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at,
        }
    }

    /// Sets the refresh token.
    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    /// Returns true if the session expired before `now` (seconds since epoch).
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at < now
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Endpoint and token used for one upload pass.
///
/// While offline mode is asserted the connector hands out the offline
/// sentinel instead: it carries no token and is never sent to a backend.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Remote endpoint URL.
    pub endpoint: String,
    /// Bearer token. Empty for the offline sentinel.
    pub token: String,
    offline: bool,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: token.into(),
            offline: false,
        }
    }

    /// Creates the sentinel credentials used while offline.
    pub fn offline(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: String::new(),
            offline: true,
        }
    }

    /// Returns true if these are the offline sentinel.
    pub fn is_offline(&self) -> bool {
        self.offline
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("endpoint", &self.endpoint)
            .field("offline", &self.is_offline())
            .finish()
    }
}
