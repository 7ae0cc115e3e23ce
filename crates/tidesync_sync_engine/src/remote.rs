//! Remote backend abstraction.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tidesync_sync_protocol::{
    Credentials, RemoteError, RemoteErrorKind, RemoteOpKind, RemoteOperation, RemoteResult,
};

/// A remote store exposing per-table writes keyed by entity id.
///
/// Implementations must report failures as classified [`RemoteError`]s; the
/// connector never inspects message text.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Inserts the row, merging into an existing row with the same id unless
    /// the backend is configured for strict inserts.
    async fn upsert(&self, credentials: &Credentials, op: &RemoteOperation) -> RemoteResult<()>;

    /// Updates the row with the operation's id.
    ///
    /// Fails with [`RemoteErrorKind::NoRowsAffected`] if no such row exists.
    async fn update(&self, credentials: &Credentials, op: &RemoteOperation) -> RemoteResult<()>;

    /// Deletes the row with the operation's id.
    ///
    /// Fails with [`RemoteErrorKind::NoRowsAffected`] if no such row exists.
    async fn delete(&self, credentials: &Credentials, op: &RemoteOperation) -> RemoteResult<()>;

    /// Dispatches on the operation kind.
    async fn apply(&self, credentials: &Credentials, op: &RemoteOperation) -> RemoteResult<()> {
        match op.kind {
            RemoteOpKind::Upsert => self.upsert(credentials, op).await,
            RemoteOpKind::Update => self.update(credentials, op).await,
            RemoteOpKind::Delete => self.delete(credentials, op).await,
        }
    }
}

/// An in-memory remote for tests and offline demos.
///
/// Failures can be injected per call, per table or globally.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    tables: Mutex<BTreeMap<String, BTreeMap<String, Value>>>,
    strict_insert: AtomicBool,
    unreachable: AtomicBool,
    unavailable: Mutex<BTreeSet<String>>,
    failures: Mutex<VecDeque<RemoteError>>,
    applied: Mutex<Vec<RemoteOperation>>,
    calls: AtomicUsize,
}

impl MemoryRemote {
    /// Creates an empty, reachable remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes upserts of existing ids fail with a duplicate-key error.
    pub fn set_strict_insert(&self, strict: bool) {
        self.strict_insert.store(strict, Ordering::SeqCst);
    }

    /// Makes every call fail as unreachable until cleared.
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Makes writes to `table` fail with a table-level error.
    pub fn set_table_unavailable(&self, table: &str, unavailable: bool) {
        let mut tables = self.unavailable.lock();
        if unavailable {
            tables.insert(table.to_owned());
        } else {
            tables.remove(table);
        }
    }

    /// Queues an error returned by the next call, ahead of normal handling.
    pub fn fail_next(&self, error: RemoteError) {
        self.failures.lock().push_back(error);
    }

    /// Inserts a row directly, bypassing failure injection.
    pub fn seed(&self, table: &str, id: &str, row: Value) {
        self.tables
            .lock()
            .entry(table.to_owned())
            .or_default()
            .insert(id.to_owned(), row);
    }

    /// Returns a row by id.
    pub fn row(&self, table: &str, id: &str) -> Option<Value> {
        self.tables.lock().get(table)?.get(id).cloned()
    }

    /// Returns all rows of a table, ordered by id.
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables
            .lock()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns successfully applied operations in order.
    pub fn applied(&self) -> Vec<RemoteOperation> {
        self.applied.lock().clone()
    }

    /// Returns the number of calls received, failed ones included.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn admit(&self, op: &RemoteOperation) -> RemoteResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RemoteError::unreachable("connection refused"));
        }
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        if self.unavailable.lock().contains(&op.table) {
            return Err(RemoteError::table_unavailable(format!(
                "relation \"{}\" does not exist",
                op.table
            )));
        }
        Ok(())
    }

    fn record(&self, op: &RemoteOperation) {
        self.applied.lock().push(op.clone());
    }
}

fn merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(existing), Value::Object(fields)) => {
            for (k, v) in fields {
                existing.insert(k, v);
            }
        }
        (target, patch) => *target = patch,
    }
}

fn row_of(op: &RemoteOperation) -> RemoteResult<Value> {
    op.body().ok_or_else(|| {
        RemoteError::new(
            RemoteErrorKind::ConstraintViolation,
            format!("{} of {} carries no row", op.kind, op.id),
        )
    })
}

#[async_trait]
impl RemoteBackend for MemoryRemote {
    async fn upsert(&self, _credentials: &Credentials, op: &RemoteOperation) -> RemoteResult<()> {
        self.admit(op)?;
        let body = row_of(op)?;
        {
            let mut tables = self.tables.lock();
            let rows = tables.entry(op.table.clone()).or_default();
            match rows.get_mut(&op.id) {
                Some(_) if self.strict_insert.load(Ordering::SeqCst) => {
                    return Err(RemoteError::duplicate_key(format!(
                        "duplicate key value violates unique constraint \"{}_pkey\"",
                        op.table
                    )));
                }
                Some(existing) => merge(existing, body),
                None => {
                    rows.insert(op.id.clone(), body);
                }
            }
        }
        self.record(op);
        Ok(())
    }

    async fn update(&self, _credentials: &Credentials, op: &RemoteOperation) -> RemoteResult<()> {
        self.admit(op)?;
        let body = row_of(op)?;
        {
            let mut tables = self.tables.lock();
            let existing = tables
                .get_mut(&op.table)
                .and_then(|rows| rows.get_mut(&op.id))
                .ok_or_else(|| RemoteError::no_rows(format!("no {} row {}", op.table, op.id)))?;
            merge(existing, body);
        }
        self.record(op);
        Ok(())
    }

    async fn delete(&self, _credentials: &Credentials, op: &RemoteOperation) -> RemoteResult<()> {
        self.admit(op)?;
        let removed = self
            .tables
            .lock()
            .get_mut(&op.table)
            .and_then(|rows| rows.remove(&op.id));
        if removed.is_none() {
            return Err(RemoteError::no_rows(format!("no {} row {}", op.table, op.id)));
        }
        self.record(op);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn creds() -> Credentials {
        Credentials::new("memory://", "tok")
    }

    #[tokio::test]
    async fn upsert_merges_by_default() {
        let remote = MemoryRemote::new();
        let op = RemoteOperation::upsert("tasks", "a", json!({"title": "x", "priority": "low"}));
        remote.apply(&creds(), &op).await.unwrap();

        let op = RemoteOperation::upsert("tasks", "a", json!({"title": "y"}));
        remote.apply(&creds(), &op).await.unwrap();

        let row = remote.row("tasks", "a").unwrap();
        assert_eq!(row["title"], "y");
        assert_eq!(row["priority"], "low");
        assert_eq!(row["id"], "a");
        assert_eq!(remote.applied().len(), 2);
    }

    #[tokio::test]
    async fn strict_insert_and_missing_rows() {
        let remote = MemoryRemote::new();
        remote.set_strict_insert(true);
        remote.seed("tasks", "a", json!({"id": "a"}));

        let err = remote
            .upsert(&creds(), &RemoteOperation::upsert("tasks", "a", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::DuplicateKey);

        let err = remote
            .update(&creds(), &RemoteOperation::update("tasks", "b", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::NoRowsAffected);

        let err = remote
            .delete(&creds(), &RemoteOperation::delete("tasks", "b"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::NoRowsAffected);
        assert!(remote.applied().is_empty());
    }

    #[tokio::test]
    async fn injected_failures() {
        let remote = MemoryRemote::new();
        let op = RemoteOperation::upsert("tasks", "a", json!({}));

        remote.set_reachable(false);
        let err = remote.apply(&creds(), &op).await.unwrap_err();
        assert!(err.kind.is_transport());
        remote.set_reachable(true);

        remote.set_table_unavailable("tasks", true);
        let err = remote.apply(&creds(), &op).await.unwrap_err();
        assert!(err.kind.is_table_level());
        remote.set_table_unavailable("tasks", false);

        remote.fail_next(RemoteError::new(RemoteErrorKind::Server, "boom"));
        assert_eq!(
            remote.apply(&creds(), &op).await.unwrap_err().kind,
            RemoteErrorKind::Server
        );
        remote.apply(&creds(), &op).await.unwrap();

        assert_eq!(remote.call_count(), 4);
        assert_eq!(remote.rows("tasks").len(), 1);
    }
}
