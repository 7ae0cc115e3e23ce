//! The local store facade.

use crate::change_feed::{ChangeEvent, ChangeFeed};
use crate::config::{StoreConfig, StoreLocation};
use crate::error::{StoreError, StoreResult, WatchError};
use crate::oplog::{self, PendingMutation};
use crate::schema::{Schema, SCHEMA_FORMAT_VERSION};
use crate::value::{QueryResult, SqlValue};
use crate::watcher::{self, QueryStream, Registry};
use parking_lot::Mutex;
use rusqlite::hooks::Action;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

const STORE_META_DDL: &str =
    "CREATE TABLE IF NOT EXISTS store_meta (key TEXT PRIMARY KEY NOT NULL, value TEXT NOT NULL);";

/// An embedded SQLite store holding entity tables and the mutation log.
///
/// `LocalStore` is cheap to clone; clones share one connection. Statement
/// execution is serialized behind a mutex, so writes are linearizable.
///
/// Every committed write emits one [`ChangeEvent`] naming the tables it
/// touched. Nothing is emitted for rolled-back work.
///
/// ```rust,ignore
/// use tidesync_core::{LocalStore, TaskService};
///
/// let store = LocalStore::open_in_memory(TaskService::schema())?;
/// let tasks = TaskService::new(store.clone())?;
/// tasks.create(NewTask::new("Buy milk"))?;
/// assert_eq!(store.pending_count()?, 1);
/// ```
#[derive(Clone)]
pub struct LocalStore {
    pub(crate) inner: Arc<StoreInner>,
}

pub(crate) struct StoreInner {
    conn: Mutex<Connection>,
    /// Tables written since the last emit, fed by the SQLite update hook.
    touched: Arc<Mutex<BTreeSet<String>>>,
    feed: ChangeFeed,
    schema: Schema,
    /// Last `PRAGMA data_version` seen by [`LocalStore::poll_external_changes`].
    data_version: AtomicI64,
    pub(crate) watchers: Arc<Registry>,
}

impl LocalStore {
    /// Opens (or creates) a store with the given configuration and schema.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if the schema is malformed
    /// - `SchemaMismatch` if the database was created with another schema
    /// - `Storage` for SQLite failures
    pub fn open(config: StoreConfig, schema: Schema) -> StoreResult<Self> {
        schema.validate()?;

        let conn = match &config.location {
            StoreLocation::File(path) => Connection::open(path)?,
            StoreLocation::Memory => Connection::open_in_memory()?,
        };
        conn.busy_timeout(config.busy_timeout)?;
        if let StoreLocation::File(_) = config.location {
            let mode: String = conn.pragma_update_and_check(
                None,
                "journal_mode",
                config.journal_mode.pragma_value(),
                |row| row.get(0),
            )?;
            debug!(journal_mode = %mode, "journal mode set");
        }

        initialize_schema(&conn, &schema)?;
        let data_version = read_data_version(&conn)?;

        let touched = Arc::new(Mutex::new(BTreeSet::new()));
        let sink = Arc::clone(&touched);
        conn.update_hook(Some(
            move |_action: Action, _db: &str, table: &str, _rowid: i64| {
                sink.lock().insert(table.to_owned());
            },
        ));

        info!(
            location = ?config.location,
            tables = schema.tables().len(),
            "local store opened"
        );

        Ok(Self {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                touched,
                feed: ChangeFeed::new(config.change_feed_capacity),
                schema,
                data_version: AtomicI64::new(data_version),
                watchers: Arc::new(Registry::default()),
            }),
        })
    }

    /// Opens a store backed by a database file.
    pub fn open_file(path: impl AsRef<Path>, schema: Schema) -> StoreResult<Self> {
        Self::open(StoreConfig::file(path), schema)
    }

    /// Opens a private in-memory store.
    pub fn open_in_memory(schema: Schema) -> StoreResult<Self> {
        Self::open(StoreConfig::in_memory(), schema)
    }

    /// Returns the schema the store was opened with.
    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    /// Applies a single statement and returns the number of affected rows.
    ///
    /// The statement runs in its own implicit transaction: on failure it has
    /// no effect. Writes to synced tables are logged by the same statement.
    pub fn execute(&self, sql: &str, params: &[SqlValue]) -> StoreResult<usize> {
        let conn = self.inner.conn.lock();
        self.inner.touched.lock().clear();
        match conn.execute(sql, params_from_iter(params.iter())) {
            Ok(affected) => {
                self.inner.announce(affected);
                Ok(affected)
            }
            Err(e) => {
                self.inner.touched.lock().clear();
                Err(e.into())
            }
        }
    }

    /// Runs a query and returns all rows.
    pub fn query(&self, sql: &str, params: &[SqlValue]) -> StoreResult<QueryResult> {
        let conn = self.inner.conn.lock();
        run_query(&conn, sql, params)
    }

    /// Runs `f` inside one SQLite transaction.
    ///
    /// The transaction commits if `f` returns `Ok` and rolls back otherwise.
    /// Subscribers are notified once, after commit.
    pub fn transaction<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut StoreTransaction<'_>) -> StoreResult<T>,
    {
        let mut conn = self.inner.conn.lock();
        self.inner.touched.lock().clear();

        let result = (|| -> StoreResult<(T, usize)> {
            let mut tx = StoreTransaction {
                tx: conn.transaction()?,
                affected: 0,
            };
            let value = f(&mut tx)?;
            let affected = tx.affected;
            tx.tx.commit()?;
            Ok((value, affected))
        })();

        match result {
            Ok((value, affected)) => {
                self.inner.announce(affected);
                Ok(value)
            }
            Err(e) => {
                self.inner.touched.lock().clear();
                Err(e)
            }
        }
    }

    /// Returns up to `limit` pending mutations in enqueue order.
    pub fn pending_mutations(&self, limit: usize) -> StoreResult<Vec<PendingMutation>> {
        oplog::pending(&self.inner.conn.lock(), limit)
    }

    /// Returns up to `limit` pending mutations enqueued after `op_id`.
    pub fn pending_mutations_after(
        &self,
        op_id: i64,
        limit: usize,
    ) -> StoreResult<Vec<PendingMutation>> {
        oplog::pending_after(&self.inner.conn.lock(), op_id, limit)
    }

    /// Returns the pending mutations for one entity in enqueue order.
    pub fn pending_for_entity(
        &self,
        table: &str,
        entity_id: &str,
    ) -> StoreResult<Vec<PendingMutation>> {
        oplog::pending_for_entity(&self.inner.conn.lock(), table, entity_id)
    }

    /// Returns a single pending mutation.
    pub fn pending_mutation(&self, op_id: i64) -> StoreResult<Option<PendingMutation>> {
        oplog::get(&self.inner.conn.lock(), op_id)
    }

    /// Returns the number of pending mutations.
    pub fn pending_count(&self) -> StoreResult<usize> {
        oplog::count(&self.inner.conn.lock())
    }

    /// Removes a mutation after the remote confirmed it.
    ///
    /// Returns false if the entry was already gone.
    pub fn complete_mutation(&self, op_id: i64) -> StoreResult<bool> {
        let conn = self.inner.conn.lock();
        self.inner.touched.lock().clear();
        let removed = oplog::remove(&conn, op_id)?;
        self.inner.announce(usize::from(removed));
        Ok(removed)
    }

    /// Picks up commits made through other connections to the same file.
    ///
    /// The change feed only sees writes made through this store. When
    /// another connection or process has committed since the last call, one
    /// event naming every table is emitted so watchers re-run. Returns true
    /// in that case.
    pub fn poll_external_changes(&self) -> StoreResult<bool> {
        let conn = self.inner.conn.lock();
        let version = read_data_version(&conn)?;
        if self.inner.data_version.swap(version, Ordering::AcqRel) == version {
            return Ok(false);
        }
        if let Some(sequence) = self.inner.feed.emit(table_names(&conn)?) {
            debug!(sequence, "external commit announced");
        }
        Ok(true)
    }

    /// Subscribes to commit events.
    pub fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.feed.subscribe()
    }

    /// Returns the sequence number of the latest commit event.
    pub fn latest_sequence(&self) -> u64 {
        self.inner.feed.latest_sequence()
    }

    /// Returns the names of all user tables, the mutation log included.
    pub fn table_names(&self) -> StoreResult<BTreeSet<String>> {
        table_names(&self.inner.conn.lock())
    }

    /// Watches a query.
    ///
    /// The returned stream yields the query's result once it has run, and
    /// again after every commit touching a table the query reads. Streams
    /// for the same query and parameters share one background refresh task.
    ///
    /// # Errors
    ///
    /// `NoRuntime` if called outside a tokio runtime. Query failures are
    /// delivered through the stream.
    pub fn watch(&self, sql: &str, params: &[SqlValue]) -> Result<QueryStream, WatchError> {
        watcher::subscribe(self, sql, params.to_vec())
    }

    /// Number of live streams for a query.
    pub fn subscriber_count(&self, sql: &str, params: &[SqlValue]) -> usize {
        self.inner.watchers.subscriber_count(sql, params)
    }

    /// Number of distinct watched queries.
    pub fn active_subscriptions(&self) -> usize {
        self.inner.watchers.len()
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("tables", &self.inner.schema.tables().len())
            .field("latest_sequence", &self.latest_sequence())
            .finish()
    }
}

impl StoreInner {
    pub(crate) fn query(&self, sql: &str, params: &[SqlValue]) -> StoreResult<QueryResult> {
        run_query(&self.conn.lock(), sql, params)
    }

    pub(crate) fn table_names(&self) -> StoreResult<BTreeSet<String>> {
        table_names(&self.conn.lock())
    }

    pub(crate) fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.feed.subscribe()
    }

    /// Emits the tables collected by the update hook.
    ///
    /// Must be called with the connection lock held so sequence order is
    /// commit order.
    fn announce(&self, affected: usize) {
        let mut tables = std::mem::take(&mut *self.touched.lock());
        if tables.is_empty() && affected > 0 {
            // SQLite skips the update hook for `DELETE` without a `WHERE`
            // clause on tables without triggers.
            tables = self.schema.tables().iter().map(|t| t.name.clone()).collect();
        }
        if let Some(sequence) = self.feed.emit(tables) {
            debug!(sequence, "commit announced");
        }
    }
}

/// A transaction handed to [`LocalStore::transaction`].
pub struct StoreTransaction<'conn> {
    tx: Transaction<'conn>,
    affected: usize,
}

impl StoreTransaction<'_> {
    /// Applies a statement within the transaction.
    pub fn execute(&mut self, sql: &str, params: &[SqlValue]) -> StoreResult<usize> {
        let n = self.tx.execute(sql, params_from_iter(params.iter()))?;
        self.affected += n;
        Ok(n)
    }

    /// Runs a query within the transaction; sees uncommitted writes.
    pub fn query(&self, sql: &str, params: &[SqlValue]) -> StoreResult<QueryResult> {
        run_query(&self.tx, sql, params)
    }

    /// Drops pending CREATE and UPDATE mutations for a table.
    ///
    /// DELETE entries are kept. Returns the number of entries dropped.
    pub fn discard_pending_upserts(&mut self, table: &str) -> StoreResult<usize> {
        let n = oplog::discard_upserts(&self.tx, table)?;
        self.affected += n;
        Ok(n)
    }
}

fn run_query(conn: &Connection, sql: &str, params: &[SqlValue]) -> StoreResult<QueryResult> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();
    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(SqlValue::from(row.get_ref(i)?));
        }
        out.push(values);
    }
    Ok(QueryResult::new(columns, out))
}

fn read_data_version(conn: &Connection) -> StoreResult<i64> {
    Ok(conn.pragma_query_value(None, "data_version", |row| row.get(0))?)
}

fn table_names(conn: &Connection) -> StoreResult<BTreeSet<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(names)
}

fn initialize_schema(conn: &Connection, schema: &Schema) -> StoreResult<()> {
    conn.execute_batch(STORE_META_DDL)?;

    let version = read_meta(conn, "format_version")?;
    let ddl = schema.ddl();

    match version {
        None => {
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(&ddl)?;
            tx.execute(
                "INSERT INTO store_meta (key, value) VALUES ('format_version', ?1), ('schema', ?2)",
                params![SCHEMA_FORMAT_VERSION.to_string(), ddl],
            )?;
            tx.commit()?;
            info!(version = SCHEMA_FORMAT_VERSION, "schema created");
            Ok(())
        }
        Some(found) => {
            if found != SCHEMA_FORMAT_VERSION.to_string() {
                return Err(StoreError::schema_mismatch(format!(
                    "store format version {found}, expected {SCHEMA_FORMAT_VERSION}"
                )));
            }
            let stored = read_meta(conn, "schema")?.unwrap_or_default();
            if stored != ddl {
                return Err(StoreError::schema_mismatch(
                    "table definitions differ from the ones the store was created with; \
                     recreate the local store",
                ));
            }
            Ok(())
        }
    }
}

fn read_meta(conn: &Connection, key: &str) -> StoreResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM store_meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}
