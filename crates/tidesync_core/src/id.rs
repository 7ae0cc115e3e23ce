//! Entity identifier.

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for an entity.
///
/// Entity IDs are random (v4) UUIDs generated on the client, so the local and
/// remote copies of a row share identity without a round trip. They are:
/// - Globally unique
/// - Immutable once assigned
/// - Never reused
///
/// The textual form is the 36-character hyphenated lowercase hex string,
/// which is also how ids are stored in SQLite and sent over the wire.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Creates a new random entity ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an entity ID from a UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Converts to a UUID.
    #[must_use]
    pub const fn to_uuid(&self) -> Uuid {
        self.0
    }

    /// Parses the hyphenated textual form.
    pub fn parse(text: &str) -> Result<Self, StoreError> {
        text.parse()
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0.hyphenated())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for EntityId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Only the canonical hyphenated form is accepted so that every id
        // round-trips to exactly the same 36 characters.
        if s.len() != 36 {
            return Err(StoreError::invalid_argument(format!(
                "entity id must be 36 characters, got {}",
                s.len()
            )));
        }
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| StoreError::invalid_argument(format!("invalid entity id {s:?}: {e}")))
    }
}

impl From<Uuid> for EntityId {
    fn from(uuid: Uuid) -> Self {
        Self::from_uuid(uuid)
    }
}

impl From<EntityId> for Uuid {
    fn from(id: EntityId) -> Self {
        id.to_uuid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_is_unique() {
        let id1 = EntityId::new();
        let id2 = EntityId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn textual_form() {
        let id = EntityId::new();
        let text = id.to_string();
        assert_eq!(text.len(), 36);
        assert_eq!(text.matches('-').count(), 4);
        assert_eq!(text, text.to_lowercase());
        assert_eq!(id.to_uuid().get_version_num(), 4);

        let parsed: EntityId = text.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn rejects_non_canonical() {
        assert!(EntityId::parse("not-an-id").is_err());
        // Simple (unhyphenated) form is a valid UUID but not a valid entity id.
        assert!(EntityId::parse("67e5504410b1426f9247bb680e5fe0c8").is_err());
    }

    #[test]
    fn serde_is_transparent() {
        let id = EntityId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }
}
