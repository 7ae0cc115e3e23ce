//! Reactive query subscriptions.
//!
//! One background task per distinct `(query, parameters)` pair re-runs the
//! query after commits touching a table it reads, and publishes the result
//! into a `tokio::sync::watch` channel. Every [`QueryStream`] for that pair
//! holds a receiver of the same channel, so slow consumers only ever skip to
//! the latest snapshot and never hold back the others.
//!
//! The registry entry and its task live exactly as long as at least one
//! stream is attached.

use crate::change_feed::ChangeEvent;
use crate::error::WatchError;
use crate::store::{LocalStore, StoreInner};
use crate::value::{QueryResult, SqlValue};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Latest state of a watched query.
#[derive(Debug, Clone)]
enum WatchState {
    /// The initial query has not completed yet.
    Pending,
    Ready(Arc<QueryResult>),
    /// Terminal.
    Failed(WatchError),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WatchKey {
    sql: String,
    params: String,
}

impl WatchKey {
    fn new(sql: &str, params: &[SqlValue]) -> Self {
        Self {
            sql: sql.trim().to_owned(),
            params: format!("{params:?}"),
        }
    }
}

struct Entry {
    id: u64,
    template: watch::Receiver<WatchState>,
    subscribers: usize,
    task: AbortHandle,
}

/// Live subscriptions of one store.
#[derive(Default)]
pub(crate) struct Registry {
    entries: Mutex<HashMap<WatchKey, Entry>>,
    next_id: AtomicU64,
}

impl Registry {
    pub(crate) fn subscriber_count(&self, sql: &str, params: &[SqlValue]) -> usize {
        self.entries
            .lock()
            .get(&WatchKey::new(sql, params))
            .map(|e| e.subscribers)
            .unwrap_or(0)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Detaches one stream from entry `id`. Streams of an entry that was
    /// already replaced are ignored.
    fn release(&self, key: &WatchKey, id: u64) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key).filter(|e| e.id == id) else {
            return;
        };
        entry.subscribers -= 1;
        if entry.subscribers == 0 {
            if let Some(entry) = entries.remove(key) {
                entry.task.abort();
                debug!(sql = %key.sql, "last subscriber detached, watch released");
            }
        }
    }
}

pub(crate) fn subscribe(
    store: &LocalStore,
    sql: &str,
    params: Vec<SqlValue>,
) -> Result<QueryStream, WatchError> {
    let runtime = Handle::try_current().map_err(|_| WatchError::NoRuntime)?;
    let key = WatchKey::new(sql, &params);
    let registry = Arc::clone(&store.inner.watchers);

    let mut entries = registry.entries.lock();
    if let Some(entry) = entries.get_mut(&key) {
        if entry.template.has_changed().is_ok() {
            entry.subscribers += 1;
            let id = entry.id;
            let mut rx = entry.template.clone();
            rx.mark_changed();
            drop(entries);
            return Ok(QueryStream::new(registry, key, id, rx));
        }
        // The refresh task is gone; a failed query gets a fresh run.
        entries.remove(&key);
        debug!(sql = %key.sql, "finished watch replaced");
    }

    let (tx, rx) = watch::channel(WatchState::Pending);
    // Subscribe before the first query runs so no commit slips between them.
    let changes = store.inner.changes();
    let task = runtime.spawn(refresh_loop(
        Arc::downgrade(&store.inner),
        key.sql.clone(),
        params,
        tx,
        changes,
    ));
    let id = registry.next_id.fetch_add(1, Ordering::Relaxed);
    entries.insert(
        key.clone(),
        Entry {
            id,
            template: rx.clone(),
            subscribers: 1,
            task: task.abort_handle(),
        },
    );
    drop(entries);
    debug!(sql = %key.sql, "watch registered");

    Ok(QueryStream::new(registry, key, id, rx))
}

/// Tables a query may read: identifier tokens that name existing tables.
///
/// Returns `None` when nothing matched, meaning every commit is relevant.
fn referenced_tables(sql: &str, existing: &BTreeSet<String>) -> Option<BTreeSet<String>> {
    let found: BTreeSet<String> = sql
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .map(str::to_ascii_lowercase)
        .filter(|token| existing.contains(token))
        .collect();
    (!found.is_empty()).then_some(found)
}

fn is_relevant(event: &ChangeEvent, tables: &Option<BTreeSet<String>>) -> bool {
    match tables {
        Some(tables) => event.touches(tables.iter().map(String::as_str)),
        None => true,
    }
}

async fn refresh_loop(
    store: Weak<StoreInner>,
    sql: String,
    params: Vec<SqlValue>,
    tx: watch::Sender<WatchState>,
    mut changes: broadcast::Receiver<ChangeEvent>,
) {
    let tables = match store.upgrade().map(|s| s.table_names()) {
        Some(Ok(existing)) => referenced_tables(&sql, &existing),
        Some(Err(e)) => {
            tx.send_replace(WatchState::Failed(WatchError::query(&sql, &e)));
            return;
        }
        None => return,
    };

    if !refresh(&store, &sql, &params, &tx) {
        return;
    }

    loop {
        let relevant = match changes.recv().await {
            Ok(event) => {
                let mut relevant = is_relevant(&event, &tables);
                // Coalesce commits that queued up while the last query ran.
                loop {
                    match changes.try_recv() {
                        Ok(event) => relevant |= is_relevant(&event, &tables),
                        Err(TryRecvError::Lagged(_)) => relevant = true,
                        Err(_) => break,
                    }
                }
                relevant
            }
            Err(RecvError::Lagged(missed)) => {
                debug!(sql = %sql, missed, "watch lagged behind change feed");
                true
            }
            Err(RecvError::Closed) => return,
        };

        if relevant && !refresh(&store, &sql, &params, &tx) {
            return;
        }
    }
}

/// Re-runs the query and publishes the result. Returns false once the
/// subscription is finished.
fn refresh(
    store: &Weak<StoreInner>,
    sql: &str,
    params: &[SqlValue],
    tx: &watch::Sender<WatchState>,
) -> bool {
    let Some(store) = store.upgrade() else {
        return false;
    };
    match store.query(sql, params) {
        Ok(result) => {
            tx.send_replace(WatchState::Ready(Arc::new(result)));
            true
        }
        Err(e) => {
            warn!(sql = %sql, error = %e, "watched query failed");
            tx.send_replace(WatchState::Failed(WatchError::query(sql, &e)));
            false
        }
    }
}

/// A subscription to a watched query.
///
/// Obtained from [`LocalStore::watch`]. Each call to [`next`](Self::next)
/// waits for a snapshot newer than the last one returned; intermediate
/// snapshots may be skipped. Dropping the stream detaches it.
///
/// ```rust,ignore
/// let mut open = store.watch(OPEN_TASKS_SQL, &[])?;
/// while let Some(snapshot) = open.next().await {
///     render(&snapshot?);
/// }
/// ```
pub struct QueryStream {
    registry: Arc<Registry>,
    key: WatchKey,
    entry: u64,
    rx: watch::Receiver<WatchState>,
    detached: bool,
    finished: bool,
}

impl QueryStream {
    fn new(
        registry: Arc<Registry>,
        key: WatchKey,
        entry: u64,
        rx: watch::Receiver<WatchState>,
    ) -> Self {
        Self {
            registry,
            key,
            entry,
            rx,
            detached: false,
            finished: false,
        }
    }

    /// Waits for the next snapshot.
    ///
    /// Returns `Some(Err(_))` once if the query fails, then `None`. Also
    /// returns `None` after [`detach`](Self::detach) or once the store is
    /// gone.
    pub async fn next(&mut self) -> Option<Result<Arc<QueryResult>, WatchError>> {
        if self.detached || self.finished {
            return None;
        }
        loop {
            if self.rx.changed().await.is_err() {
                self.finished = true;
                return None;
            }
            let state = self.rx.borrow_and_update().clone();
            match state {
                WatchState::Pending => continue,
                WatchState::Ready(result) => return Some(Ok(result)),
                WatchState::Failed(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            }
        }
    }

    /// Returns the latest snapshot without waiting, if one exists.
    pub fn current(&self) -> Option<Arc<QueryResult>> {
        match &*self.rx.borrow() {
            WatchState::Ready(result) => Some(Arc::clone(result)),
            _ => None,
        }
    }

    /// Makes the next call to [`next`](Self::next) return the current
    /// snapshot again instead of waiting for a new one.
    pub fn restart(&mut self) {
        if self.detached {
            return;
        }
        self.finished = false;
        self.rx.mark_changed();
    }

    /// The watched query text.
    pub fn sql(&self) -> &str {
        &self.key.sql
    }

    /// Returns true once the stream has been detached.
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Detaches from the subscription. Idempotent.
    ///
    /// When the last stream for a query detaches, its background task stops.
    pub fn detach(&mut self) {
        if !self.detached {
            self.detached = true;
            self.registry.release(&self.key, self.entry);
        }
    }
}

impl Drop for QueryStream {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for QueryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryStream")
            .field("sql", &self.key.sql)
            .field("detached", &self.detached)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, ColumnType, Schema, TableDef};
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn store() -> LocalStore {
        LocalStore::open_in_memory(
            Schema::new()
                .with_table(
                    TableDef::synced("notes").column(ColumnDef::required("body", ColumnType::Text)),
                )
                .with_table(
                    TableDef::synced("tags").column(ColumnDef::required("name", ColumnType::Text)),
                ),
        )
        .unwrap()
    }

    async fn next(stream: &mut QueryStream) -> Arc<QueryResult> {
        timeout(WAIT, stream.next())
            .await
            .expect("snapshot in time")
            .expect("stream open")
            .expect("query ok")
    }

    #[test]
    fn referenced_tables_from_tokens() {
        let existing: BTreeSet<String> =
            ["notes", "tags", "mutation_log"].iter().map(|s| s.to_string()).collect();

        let found = referenced_tables(
            "SELECT n.body FROM notes n JOIN tags ON tags.name = n.body",
            &existing,
        )
        .unwrap();
        assert_eq!(found.len(), 2);

        let found = referenced_tables("select count(*) from MUTATION_LOG", &existing).unwrap();
        assert!(found.contains("mutation_log"));

        assert!(referenced_tables("SELECT 1", &existing).is_none());
    }

    #[test]
    fn watch_needs_runtime() {
        let store = store();
        let err = store.watch("SELECT * FROM notes", &[]).unwrap_err();
        assert_eq!(err, WatchError::NoRuntime);
    }

    #[tokio::test]
    async fn initial_snapshot_then_updates() {
        let store = store();
        let mut stream = store.watch("SELECT body FROM notes ORDER BY body", &[]).unwrap();

        assert!(next(&mut stream).await.is_empty());

        store
            .execute("INSERT INTO notes (id, body) VALUES ('n1', 'a')", &[])
            .unwrap();
        let snapshot = next(&mut stream).await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(stream.current().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unrelated_tables_do_not_refresh() {
        let store = store();
        let mut stream = store.watch("SELECT * FROM notes", &[]).unwrap();
        next(&mut stream).await;

        store
            .execute("INSERT INTO tags (id, name) VALUES ('t1', 'x')", &[])
            .unwrap();
        let waited = timeout(Duration::from_millis(100), stream.next()).await;
        assert!(waited.is_err(), "no snapshot for unrelated commit");

        store
            .execute("INSERT INTO notes (id, body) VALUES ('n1', 'a')", &[])
            .unwrap();
        assert_eq!(next(&mut stream).await.len(), 1);
    }

    #[tokio::test]
    async fn streams_share_one_subscription() {
        let store = store();
        let sql = "SELECT * FROM notes WHERE body = ?1";
        let params = ["a".into()];

        let mut first = store.watch(sql, &params).unwrap();
        next(&mut first).await;
        let mut second = store.watch(sql, &params).unwrap();
        assert_eq!(store.subscriber_count(sql, &params), 2);
        assert_eq!(store.active_subscriptions(), 1);

        // A late subscriber gets the current snapshot right away.
        assert!(next(&mut second).await.is_empty());

        // Different parameters are a different subscription.
        let _other = store.watch(sql, &["b".into()]).unwrap();
        assert_eq!(store.active_subscriptions(), 2);

        first.detach();
        first.detach();
        assert_eq!(store.subscriber_count(sql, &params), 1);
        assert!(first.next().await.is_none());

        drop(second);
        assert_eq!(store.subscriber_count(sql, &params), 0);
        assert_eq!(store.active_subscriptions(), 1);
    }

    #[tokio::test]
    async fn restart_redelivers_current() {
        let store = store();
        let mut stream = store.watch("SELECT * FROM notes", &[]).unwrap();
        let first = next(&mut stream).await;

        stream.restart();
        let again = next(&mut stream).await;
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[tokio::test]
    async fn failing_query_is_terminal() {
        let store = store();
        let mut stream = store.watch("SELECT * FROM missing_table", &[]).unwrap();

        let result = timeout(WAIT, stream.next()).await.unwrap().unwrap();
        assert!(matches!(result, Err(WatchError::Query { .. })));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn failed_watch_reruns_for_new_subscriber() {
        let store = store();
        let sql = "SELECT * FROM scratch";
        let mut stale = store.watch(sql, &[]).unwrap();
        let result = timeout(WAIT, stale.next()).await.unwrap().unwrap();
        assert!(result.is_err());

        store.execute("CREATE TABLE scratch (x TEXT)", &[]).unwrap();
        let mut fresh = store.watch(sql, &[]).unwrap();
        assert!(next(&mut fresh).await.is_empty());
        assert_eq!(store.subscriber_count(sql, &[]), 1);

        // Detaching the failed stream leaves the new entry alone.
        drop(stale);
        assert_eq!(store.subscriber_count(sql, &[]), 1);
        assert_eq!(store.active_subscriptions(), 1);

        store.execute("INSERT INTO scratch (x) VALUES ('a')", &[]).unwrap();
        assert_eq!(next(&mut fresh).await.len(), 1);
    }

    #[tokio::test]
    async fn burst_of_commits_is_coalesced() {
        let store = store();
        let mut stream = store.watch("SELECT * FROM notes", &[]).unwrap();
        next(&mut stream).await;

        for i in 0..20 {
            store
                .execute(
                    "INSERT INTO notes (id, body) VALUES (?1, 'x')",
                    &[format!("n{i}").into()],
                )
                .unwrap();
        }

        // Snapshots may be skipped, but the last one reflects every commit.
        let mut latest = next(&mut stream).await;
        while latest.len() < 20 {
            latest = next(&mut stream).await;
        }
        assert_eq!(latest.len(), 20);
    }
}
