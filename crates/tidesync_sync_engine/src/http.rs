//! HTTP backend implementation.
//!
//! This module speaks a PostgREST-style JSON dialect: one REST collection per
//! table, rows addressed by `id=eq.{id}` filters. The actual HTTP client is
//! abstracted via a trait so tests can script responses; [`ReqwestClient`] is
//! the production implementation.
//!
//! Responses are classified into [`RemoteErrorKind`] here and nowhere else.

use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteBackend;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tidesync_sync_protocol::{
    Credentials, RemoteError, RemoteErrorKind, RemoteOperation, RemoteResult, WireErrorBody,
};
use tracing::debug;

/// HTTP method subset used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// GET.
    Get,
    /// POST.
    Post,
    /// PATCH.
    Patch,
    /// DELETE.
    Delete,
}

/// A request handed to an [`HttpClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Method.
    pub method: HttpMethod,
    /// Absolute URL.
    pub url: String,
    /// Extra headers.
    pub headers: Vec<(String, String)>,
    /// Body bytes.
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// A GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    /// A POST request.
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    /// A PATCH request.
    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Patch, url)
    }

    /// A DELETE request.
    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, url)
    }

    /// Adds a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Adds `Authorization: Bearer {token}`.
    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {token}"))
    }

    /// Sets a JSON body.
    pub fn json(self, body: &Value) -> Self {
        let mut request = self.header("Content-Type", "application/json");
        request.body = Some(body.to_string().into_bytes());
        request
    }

    /// Returns the value of a header, if set.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A raw HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self { status, body }
    }

    /// Creates a response with a JSON body.
    pub fn json(status: u16, body: &Value) -> Self {
        Self::new(status, body.to_string().into_bytes())
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client abstraction.
///
/// `Err` means the request never produced a response (DNS, connect, TLS or
/// timeout failures). Any response, whatever its status, is `Ok`.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a request and returns the response.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String>;
}

/// [`HttpClient`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Creates a client with a per-request timeout.
    pub fn new(timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Protocol(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| e.to_string())?;
        Ok(HttpResponse::new(status, body.to_vec()))
    }
}

/// PostgREST-style remote backend.
pub struct RestBackend<C: HttpClient> {
    client: Arc<C>,
    strict_insert: bool,
}

impl<C: HttpClient> RestBackend<C> {
    /// Creates a backend whose upserts merge on duplicate ids.
    pub fn new(client: Arc<C>) -> Self {
        Self {
            client,
            strict_insert: false,
        }
    }

    /// Sends plain inserts instead of upserts, so existing ids are reported
    /// as duplicate keys.
    pub fn strict_insert(mut self, strict: bool) -> Self {
        self.strict_insert = strict;
        self
    }

    fn collection_url(credentials: &Credentials, op: &RemoteOperation) -> String {
        format!("{}/{}", credentials.endpoint.trim_end_matches('/'), op.table)
    }

    fn row_url(credentials: &Credentials, op: &RemoteOperation) -> String {
        format!("{}?id=eq.{}", Self::collection_url(credentials, op), op.id)
    }

    async fn send(&self, request: HttpRequest) -> RemoteResult<HttpResponse> {
        let method = request.method;
        let url = request.url.clone();
        let response = self
            .client
            .send(request)
            .await
            .map_err(RemoteError::unreachable)?;
        debug!(?method, %url, status = response.status, "remote responded");

        if response.is_success() {
            Ok(response)
        } else {
            Err(WireErrorBody::parse(&response.body).into_error(response.status))
        }
    }

    fn body(op: &RemoteOperation) -> RemoteResult<Value> {
        op.body().ok_or_else(|| {
            RemoteError::new(
                RemoteErrorKind::ConstraintViolation,
                format!("{} of {} carries no row", op.kind, op.id),
            )
        })
    }
}

/// Number of rows in a `return=representation` body.
///
/// A body that is not a JSON array (e.g. a 204 from a backend that ignores
/// the preference) is taken as one affected row.
fn rows_affected(body: &[u8]) -> usize {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Array(rows)) => rows.len(),
        _ => 1,
    }
}

#[async_trait]
impl<C: HttpClient> RemoteBackend for RestBackend<C> {
    async fn upsert(&self, credentials: &Credentials, op: &RemoteOperation) -> RemoteResult<()> {
        let mut request = HttpRequest::post(Self::collection_url(credentials, op))
            .bearer(&credentials.token)
            .json(&Self::body(op)?);
        if !self.strict_insert {
            request = request.header("Prefer", "resolution=merge-duplicates");
        }
        self.send(request).await.map(|_| ())
    }

    async fn update(&self, credentials: &Credentials, op: &RemoteOperation) -> RemoteResult<()> {
        let request = HttpRequest::patch(Self::row_url(credentials, op))
            .bearer(&credentials.token)
            .header("Prefer", "return=representation")
            .json(&Self::body(op)?);
        let response = self.send(request).await?;
        if rows_affected(&response.body) == 0 {
            return Err(RemoteError::no_rows(format!("no {} row with id {}", op.table, op.id)));
        }
        Ok(())
    }

    async fn delete(&self, credentials: &Credentials, op: &RemoteOperation) -> RemoteResult<()> {
        let request = HttpRequest::delete(Self::row_url(credentials, op))
            .bearer(&credentials.token)
            .header("Prefer", "return=representation");
        let response = self.send(request).await?;
        if rows_affected(&response.body) == 0 {
            return Err(RemoteError::no_rows(format!("no {} row with id {}", op.table, op.id)));
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedClient;
    use super::*;
    use serde_json::json;
    use tidesync_sync_protocol::RemoteErrorKind;

    fn creds() -> Credentials {
        Credentials::new("https://api.example.com/rest/v1", "tok")
    }

    fn row() -> Value {
        json!({"id": "t1", "title": "Buy milk"})
    }

    fn backend() -> (Arc<ScriptedClient>, RestBackend<ScriptedClient>) {
        let client = Arc::new(ScriptedClient::new());
        (Arc::clone(&client), RestBackend::new(client))
    }

    #[tokio::test]
    async fn upsert_request_shape() {
        let (client, backend) = backend();
        client.push(HttpResponse::new(201, Vec::new()));

        backend
            .upsert(&creds(), &RemoteOperation::upsert("tasks", "t1", row()))
            .await
            .unwrap();

        let request = &client.requests()[0];
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.url, "https://api.example.com/rest/v1/tasks");
        assert_eq!(request.header_value("authorization"), Some("Bearer tok"));
        assert_eq!(
            request.header_value("Prefer"),
            Some("resolution=merge-duplicates")
        );
        let body: Value = serde_json::from_slice(request.body.as_ref().unwrap()).unwrap();
        assert_eq!(body["title"], "Buy milk");
    }

    #[tokio::test]
    async fn strict_insert_reports_duplicate_key() {
        let client = Arc::new(ScriptedClient::new());
        let backend = RestBackend::new(Arc::clone(&client)).strict_insert(true);
        client.push(HttpResponse::json(
            409,
            &json!({"code": "23505", "message": "duplicate key value violates unique constraint"}),
        ));

        let err = backend
            .upsert(&creds(), &RemoteOperation::upsert("tasks", "t1", row()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::DuplicateKey);
        assert!(client.requests()[0].header_value("Prefer").is_none());
    }

    #[tokio::test]
    async fn update_with_no_rows() {
        let (client, backend) = backend();
        client.push(HttpResponse::json(200, &json!([])));
        client.push(HttpResponse::json(200, &json!([{"id": "t1"}])));

        let op = RemoteOperation::update("tasks", "t1", row());
        let err = backend.update(&creds(), &op).await.unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::NoRowsAffected);
        backend.update(&creds(), &op).await.unwrap();

        let request = &client.requests()[0];
        assert_eq!(request.method, HttpMethod::Patch);
        assert_eq!(
            request.url,
            "https://api.example.com/rest/v1/tasks?id=eq.t1"
        );
        assert_eq!(request.header_value("Prefer"), Some("return=representation"));
    }

    #[tokio::test]
    async fn delete_and_classification() {
        let (client, backend) = backend();
        let op = RemoteOperation::delete("tasks", "t1");

        client.push(HttpResponse::new(204, Vec::new()));
        backend.delete(&creds(), &op).await.unwrap();

        client.push(HttpResponse::json(200, &json!([])));
        assert_eq!(
            backend.delete(&creds(), &op).await.unwrap_err().kind,
            RemoteErrorKind::NoRowsAffected
        );

        client.push(HttpResponse::json(404, &json!({"code": "42P01", "message": "relation does not exist"})));
        assert_eq!(
            backend.delete(&creds(), &op).await.unwrap_err().kind,
            RemoteErrorKind::TableUnavailable
        );

        client.push(HttpResponse::new(503, b"unavailable".to_vec()));
        assert_eq!(
            backend.delete(&creds(), &op).await.unwrap_err().kind,
            RemoteErrorKind::Server
        );

        client.push_failure("connection refused");
        assert_eq!(
            backend.delete(&creds(), &op).await.unwrap_err().kind,
            RemoteErrorKind::Unreachable
        );
    }

    #[tokio::test]
    async fn apply_dispatches_by_kind() {
        let (client, backend) = backend();
        client.push(HttpResponse::json(200, &json!([{"id": "t1"}])));
        backend
            .apply(&creds(), &RemoteOperation::update("tasks", "t1", row()))
            .await
            .unwrap();
        assert_eq!(client.requests()[0].method, HttpMethod::Patch);
    }
}
