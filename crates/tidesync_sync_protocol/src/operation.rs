//! Remote write operations.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Kind of remote write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteOpKind {
    /// Insert the row, or merge into an existing row with the same id.
    Upsert,
    /// Update the row with the given id.
    Update,
    /// Delete the row with the given id.
    Delete,
}

impl RemoteOpKind {
    /// Returns the lowercase name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteOpKind::Upsert => "upsert",
            RemoteOpKind::Update => "update",
            RemoteOpKind::Delete => "delete",
        }
    }
}

impl fmt::Display for RemoteOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single write against a remote resource collection keyed by entity id.
///
/// # Fields
///
/// - `kind`: upsert, update or delete
/// - `table`: the remote collection (same name as the local table)
/// - `id`: the client-generated entity id
/// - `row`: the row image for upsert/update, `None` for delete
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteOperation {
    /// Operation kind.
    pub kind: RemoteOpKind,
    /// Remote table name.
    pub table: String,
    /// Entity id.
    pub id: String,
    /// Row image (upsert/update only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<Value>,
}

impl RemoteOperation {
    /// Creates an upsert-by-id operation.
    pub fn upsert(table: impl Into<String>, id: impl Into<String>, row: Value) -> Self {
        Self {
            kind: RemoteOpKind::Upsert,
            table: table.into(),
            id: id.into(),
            row: Some(row),
        }
    }

    /// Creates an update-by-id operation.
    pub fn update(table: impl Into<String>, id: impl Into<String>, row: Value) -> Self {
        Self {
            kind: RemoteOpKind::Update,
            table: table.into(),
            id: id.into(),
            row: Some(row),
        }
    }

    /// Creates a delete-by-id operation.
    pub fn delete(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: RemoteOpKind::Delete,
            table: table.into(),
            id: id.into(),
            row: None,
        }
    }

    /// Returns the same write re-targeted to another kind, keeping id and row.
    ///
    /// Used by the recovery rules: a rejected upsert is retried as an update
    /// and a no-op update is retried as an upsert.
    pub fn retarget(&self, kind: RemoteOpKind) -> Self {
        let row = match kind {
            RemoteOpKind::Delete => None,
            _ => self.row.clone(),
        };
        Self {
            kind,
            table: self.table.clone(),
            id: self.id.clone(),
            row,
        }
    }

    /// Returns the row body to send, guaranteeing it carries the entity id.
    pub fn body(&self) -> Option<Value> {
        let mut row = self.row.clone()?;
        if let Value::Object(ref mut map) = row {
            map.entry("id")
                .or_insert_with(|| Value::String(self.id.clone()));
        }
        Some(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn constructors_set_kind() {
        let op = RemoteOperation::upsert("tasks", "a", json!({"title": "x"}));
        assert_eq!(op.kind, RemoteOpKind::Upsert);
        assert!(op.row.is_some());

        let op = RemoteOperation::delete("tasks", "a");
        assert_eq!(op.kind, RemoteOpKind::Delete);
        assert!(op.row.is_none());
    }

    #[test]
    fn retarget_keeps_identity() {
        let op = RemoteOperation::upsert("tasks", "abc", json!({"title": "Buy milk"}));
        let update = op.retarget(RemoteOpKind::Update);

        assert_eq!(update.kind, RemoteOpKind::Update);
        assert_eq!(update.table, "tasks");
        assert_eq!(update.id, "abc");
        assert_eq!(update.row, op.row);

        let delete = op.retarget(RemoteOpKind::Delete);
        assert!(delete.row.is_none());
    }

    #[test]
    fn body_injects_missing_id() {
        let op = RemoteOperation::update("tasks", "abc", json!({"title": "t"}));
        let body = op.body().unwrap();
        assert_eq!(body["id"], "abc");

        let op = RemoteOperation::update("tasks", "abc", json!({"id": "abc", "title": "t"}));
        assert_eq!(op.body().unwrap()["id"], "abc");

        assert!(RemoteOperation::delete("tasks", "abc").body().is_none());
    }

    #[test]
    fn serde_shape() {
        let op = RemoteOperation::delete("tasks", "abc");
        let text = serde_json::to_string(&op).unwrap();
        assert_eq!(text, r#"{"kind":"delete","table":"tasks","id":"abc"}"#);
    }
}
