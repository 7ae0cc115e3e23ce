//! The mutation log: pending local writes awaiting upload.
//!
//! Entries are appended by triggers (see `schema`) and removed only when the
//! uploader confirms the remote applied them.
//!
//! # Invariants
//!
//! - `op_id` is `AUTOINCREMENT`, so id order is enqueue order and ids are
//!   never reused, even after the log is drained
//! - Entries are never rewritten in place

use crate::error::{StoreError, StoreResult};
use crate::value::SqlValue;
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Name of the mutation log table.
pub const MUTATION_LOG_TABLE: &str = "mutation_log";

pub(crate) const MUTATION_LOG_DDL: &str = "CREATE TABLE IF NOT EXISTS mutation_log (
    op_id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_table TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    kind TEXT NOT NULL CHECK (kind IN ('CREATE', 'UPDATE', 'DELETE')),
    payload TEXT,
    enqueued_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_mutation_log_entity ON mutation_log (entity_table, entity_id);
";

const SELECT_COLUMNS: &str = "op_id, entity_table, entity_id, kind, payload, enqueued_at";

/// Kind of logged mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationKind {
    /// Row inserted.
    Create,
    /// Row updated.
    Update,
    /// Row deleted.
    Delete,
}

impl MutationKind {
    /// Returns the value stored in the `kind` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Create => "CREATE",
            MutationKind::Update => "UPDATE",
            MutationKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(MutationKind::Create),
            "UPDATE" => Ok(MutationKind::Update),
            "DELETE" => Ok(MutationKind::Delete),
            other => Err(StoreError::corrupt_row(
                MUTATION_LOG_TABLE,
                format!("unknown mutation kind {other:?}"),
            )),
        }
    }
}

/// One pending entry of the mutation log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingMutation {
    /// Stable operation id; ascending in enqueue order.
    pub op_id: i64,
    /// Table the entity lives in.
    pub entity_table: String,
    /// Entity id.
    pub entity_id: String,
    /// Mutation kind.
    pub kind: MutationKind,
    /// Row image after the write (CREATE/UPDATE), `None` for DELETE.
    pub payload: Option<Value>,
    /// Enqueue time, milliseconds since the Unix epoch.
    pub enqueued_at: i64,
}

impl PendingMutation {
    fn from_row(row: &rusqlite::Row<'_>) -> StoreResult<Self> {
        let kind: String = row.get(3)?;
        let payload: Option<String> = row.get(4)?;
        Ok(Self {
            op_id: row.get(0)?,
            entity_table: row.get(1)?,
            entity_id: row.get(2)?,
            kind: kind.parse()?,
            payload: payload.map(|p| serde_json::from_str(&p)).transpose()?,
            enqueued_at: row.get(5)?,
        })
    }
}

fn collect(
    conn: &Connection,
    sql: &str,
    params: &[SqlValue],
) -> StoreResult<Vec<PendingMutation>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(PendingMutation::from_row(row)?);
    }
    Ok(out)
}

/// Reads up to `limit` pending entries in enqueue order.
pub(crate) fn pending(conn: &Connection, limit: usize) -> StoreResult<Vec<PendingMutation>> {
    pending_after(conn, 0, limit)
}

/// Reads up to `limit` pending entries with `op_id > after`, in enqueue order.
pub(crate) fn pending_after(
    conn: &Connection,
    after: i64,
    limit: usize,
) -> StoreResult<Vec<PendingMutation>> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    collect(
        conn,
        &format!(
            "SELECT {SELECT_COLUMNS} FROM {MUTATION_LOG_TABLE} \
             WHERE op_id > ?1 ORDER BY op_id LIMIT ?2"
        ),
        &[SqlValue::Integer(after), SqlValue::Integer(limit)],
    )
}

/// Reads every pending entry for one entity in enqueue order.
pub(crate) fn pending_for_entity(
    conn: &Connection,
    table: &str,
    entity_id: &str,
) -> StoreResult<Vec<PendingMutation>> {
    collect(
        conn,
        &format!(
            "SELECT {SELECT_COLUMNS} FROM {MUTATION_LOG_TABLE} \
             WHERE entity_table = ?1 AND entity_id = ?2 ORDER BY op_id"
        ),
        &[table.into(), entity_id.into()],
    )
}

/// Reads a single entry.
pub(crate) fn get(conn: &Connection, op_id: i64) -> StoreResult<Option<PendingMutation>> {
    let found = collect(
        conn,
        &format!("SELECT {SELECT_COLUMNS} FROM {MUTATION_LOG_TABLE} WHERE op_id = ?1"),
        &[SqlValue::Integer(op_id)],
    )?;
    Ok(found.into_iter().next())
}

/// Number of pending entries.
pub(crate) fn count(conn: &Connection) -> StoreResult<usize> {
    let n: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {MUTATION_LOG_TABLE}"),
        [],
        |row| row.get(0),
    )?;
    Ok(usize::try_from(n).unwrap_or(0))
}

/// Removes an entry. Returns false if it was already gone.
pub(crate) fn remove(conn: &Connection, op_id: i64) -> StoreResult<bool> {
    let n = conn.execute(
        &format!("DELETE FROM {MUTATION_LOG_TABLE} WHERE op_id = ?1"),
        params![op_id],
    )?;
    Ok(n > 0)
}

/// Drops pending CREATE and UPDATE entries for every entity of a table.
///
/// Returns the number of entries dropped.
pub(crate) fn discard_upserts(conn: &Connection, table: &str) -> StoreResult<usize> {
    let n = conn.execute(
        &format!(
            "DELETE FROM {MUTATION_LOG_TABLE} \
             WHERE entity_table = ?1 AND kind IN ('CREATE', 'UPDATE')"
        ),
        params![table],
    )?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(MUTATION_LOG_DDL).unwrap();
        conn
    }

    fn append(conn: &Connection, id: &str, kind: MutationKind) {
        let payload = match kind {
            MutationKind::Delete => None,
            _ => Some(format!("{{\"id\":\"{id}\"}}")),
        };
        conn.execute(
            "INSERT INTO mutation_log (entity_table, entity_id, kind, payload, enqueued_at) \
             VALUES ('tasks', ?1, ?2, ?3, 0)",
            params![id, kind.as_str(), payload],
        )
        .unwrap();
    }

    #[test]
    fn kind_round_trip() {
        for kind in [MutationKind::Create, MutationKind::Update, MutationKind::Delete] {
            assert_eq!(kind.as_str().parse::<MutationKind>().unwrap(), kind);
        }
        assert!("UPSERT".parse::<MutationKind>().is_err());
    }

    #[test]
    fn pending_in_enqueue_order() {
        let conn = log();
        append(&conn, "a", MutationKind::Create);
        append(&conn, "b", MutationKind::Create);
        append(&conn, "a", MutationKind::Update);

        let all = pending(&conn, 10).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].op_id < w[1].op_id));
        assert_eq!(all[0].payload.as_ref().unwrap()["id"], "a");

        let limited = pending(&conn, 2).unwrap();
        assert_eq!(limited.len(), 2);

        let rest = pending_after(&conn, limited[1].op_id, 10).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].op_id, all[2].op_id);

        let for_a = pending_for_entity(&conn, "tasks", "a").unwrap();
        assert_eq!(
            for_a.iter().map(|m| m.kind).collect::<Vec<_>>(),
            vec![MutationKind::Create, MutationKind::Update]
        );
    }

    #[test]
    fn remove_is_idempotent() {
        let conn = log();
        append(&conn, "a", MutationKind::Delete);
        let op_id = pending(&conn, 1).unwrap()[0].op_id;

        assert!(get(&conn, op_id).unwrap().unwrap().payload.is_none());
        assert!(remove(&conn, op_id).unwrap());
        assert!(!remove(&conn, op_id).unwrap());
        assert!(get(&conn, op_id).unwrap().is_none());
        assert_eq!(count(&conn).unwrap(), 0);
    }

    #[test]
    fn get_decodes_like_listing() {
        let conn = log();
        append(&conn, "a", MutationKind::Create);
        append(&conn, "a", MutationKind::Update);

        for listed in pending(&conn, 10).unwrap() {
            assert_eq!(get(&conn, listed.op_id).unwrap(), Some(listed));
        }
    }

    #[test]
    fn op_ids_not_reused_after_drain() {
        let conn = log();
        append(&conn, "a", MutationKind::Create);
        let first = pending(&conn, 1).unwrap()[0].op_id;
        remove(&conn, first).unwrap();

        append(&conn, "b", MutationKind::Create);
        let second = pending(&conn, 1).unwrap()[0].op_id;
        assert!(second > first);
    }

    #[test]
    fn discard_upserts_keeps_deletes() {
        let conn = log();
        append(&conn, "a", MutationKind::Create);
        append(&conn, "a", MutationKind::Update);
        append(&conn, "b", MutationKind::Delete);

        assert_eq!(discard_upserts(&conn, "tasks").unwrap(), 2);
        let left = pending(&conn, 10).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].kind, MutationKind::Delete);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn kind() -> impl Strategy<Value = MutationKind> {
            prop_oneof![
                Just(MutationKind::Create),
                Just(MutationKind::Update),
                Just(MutationKind::Delete),
            ]
        }

        proptest! {
            #[test]
            fn paging_preserves_enqueue_order(
                entries in prop::collection::vec((0..4usize, kind()), 0..40),
                page in 1..8usize,
            ) {
                let conn = log();
                for (entity, kind) in &entries {
                    append(&conn, &format!("e{entity}"), *kind);
                }

                let mut paged = Vec::new();
                let mut cursor = 0;
                loop {
                    let batch = pending_after(&conn, cursor, page).unwrap();
                    let Some(last) = batch.last() else { break };
                    cursor = last.op_id;
                    paged.extend(batch);
                }

                prop_assert_eq!(paged.len(), entries.len());
                prop_assert!(paged.windows(2).all(|w| w[0].op_id < w[1].op_id));
                for (logged, (entity, kind)) in paged.iter().zip(&entries) {
                    prop_assert_eq!(&logged.entity_id, &format!("e{entity}"));
                    prop_assert_eq!(logged.kind, *kind);
                }
            }
        }
    }
}
