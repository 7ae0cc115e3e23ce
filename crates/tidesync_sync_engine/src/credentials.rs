//! Credential sources.
//!
//! Account and session management live outside the engine; it only needs a
//! way to obtain the current session and to refresh an expired one.

use crate::error::{SyncError, SyncResult};
use crate::http::{HttpClient, HttpRequest};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use tidesync_sync_protocol::Session;

/// An external source of sessions.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Returns the current session.
    async fn current_session(&self) -> SyncResult<Session>;

    /// Exchanges an expired session for a fresh one.
    async fn refresh_session(&self, expired: &Session) -> SyncResult<Session>;
}

/// A fixed session, optionally followed by one refreshed session.
///
/// Useful for tests and for deployments that authenticate with a long-lived
/// token.
#[derive(Debug)]
pub struct StaticCredentials {
    session: Mutex<Session>,
    refreshed: Mutex<Option<Session>>,
}

impl StaticCredentials {
    /// Creates a source that always returns `session`.
    pub fn new(session: Session) -> Self {
        Self {
            session: Mutex::new(session),
            refreshed: Mutex::new(None),
        }
    }

    /// Creates a source from a bearer token that never expires.
    pub fn token(token: impl Into<String>) -> Self {
        Self::new(Session::new(token, i64::MAX))
    }

    /// Sets the session handed out on the next refresh.
    pub fn with_refresh(self, next: Session) -> Self {
        *self.refreshed.lock() = Some(next);
        self
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn current_session(&self) -> SyncResult<Session> {
        Ok(self.session.lock().clone())
    }

    async fn refresh_session(&self, _expired: &Session) -> SyncResult<Session> {
        let next = self
            .refreshed
            .lock()
            .take()
            .ok_or_else(|| SyncError::Credential("no refreshed session available".into()))?;
        *self.session.lock() = next.clone();
        Ok(next)
    }
}

/// Fetches sessions from an HTTP credential service.
///
/// - `GET {endpoint}/session` returns the current [`Session`] as JSON
/// - `POST {endpoint}/refresh` with `{"refresh_token": ...}` returns a new one
pub struct HttpCredentialSource<C: HttpClient> {
    endpoint: String,
    client: Arc<C>,
}

impl<C: HttpClient> HttpCredentialSource<C> {
    /// Creates a credential source.
    pub fn new(endpoint: impl Into<String>, client: Arc<C>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_owned(),
            client,
        }
    }

    async fn fetch(&self, request: HttpRequest) -> SyncResult<Session> {
        let response = self
            .client
            .send(request)
            .await
            .map_err(|e| SyncError::Credential(format!("credential service unreachable: {e}")))?;
        if !response.is_success() {
            return Err(SyncError::Credential(format!(
                "credential service returned HTTP {}",
                response.status
            )));
        }
        serde_json::from_slice(&response.body)
            .map_err(|e| SyncError::Credential(format!("malformed session: {e}")))
    }
}

#[async_trait]
impl<C: HttpClient> CredentialSource for HttpCredentialSource<C> {
    async fn current_session(&self) -> SyncResult<Session> {
        self.fetch(HttpRequest::get(format!("{}/session", self.endpoint)))
            .await
    }

    async fn refresh_session(&self, expired: &Session) -> SyncResult<Session> {
        let token = expired
            .refresh_token
            .as_deref()
            .ok_or_else(|| SyncError::Credential("session has no refresh token".into()))?;
        let body = json!({ "refresh_token": token });
        self.fetch(HttpRequest::post(format!("{}/refresh", self.endpoint)).json(&body))
            .await
    }
}
