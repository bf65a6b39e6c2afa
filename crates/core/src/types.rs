use std::fmt;

use serde::{Deserialize, Serialize};

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Prefix carried by client-generated placeholder ids.
pub const TEMP_ID_PREFIX: &str = "tmp-";

/// Opaque shape identifier.
///
/// Ids minted locally before the store has committed a create carry the
/// [`TEMP_ID_PREFIX`]; every other id is durable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShapeId(String);

impl ShapeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh placeholder id for a shape that has not been persisted.
    pub fn temporary() -> Self {
        Self(format!("{TEMP_ID_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    /// Mint a durable id. Only store adapters should call this.
    pub fn durable() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShapeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShapeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ShapeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identity of an actor (a human client or an automation agent).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for OwnerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// An actor plus the display metadata shown next to shapes it locks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub id: OwnerId,
    pub name: String,
    pub color: String,
}

impl Owner {
    pub fn new(id: impl Into<OwnerId>, name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            color: color.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporary_ids_are_flagged() {
        let id = ShapeId::temporary();
        assert!(id.is_temporary());
        assert!(id.as_str().starts_with(TEMP_ID_PREFIX));
    }

    #[test]
    fn durable_ids_are_not_temporary() {
        assert!(!ShapeId::durable().is_temporary());
        assert!(!ShapeId::from("shape-1").is_temporary());
    }

    #[test]
    fn temporary_ids_are_unique() {
        assert_ne!(ShapeId::temporary(), ShapeId::temporary());
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let json = serde_json::to_string(&OwnerId::from("alice")).unwrap();
        assert_eq!(json, r#""alice""#);
        let id: ShapeId = serde_json::from_str(r#""shape-9""#).unwrap();
        assert_eq!(id, ShapeId::from("shape-9"));
    }
}
