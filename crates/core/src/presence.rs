//! Ephemeral per-client liveness records.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::types::{OwnerId, ShapeId, Timestamp};

/// Canvas-space cursor position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
}

/// A client's entry in the presence channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub client_id: OwnerId,
    pub display_name: String,
    pub online: bool,
    pub last_seen: Timestamp,
    #[serde(default)]
    pub cursor: Option<Cursor>,
    #[serde(default)]
    pub currently_editing: Option<ShapeId>,
}

impl PresenceRecord {
    pub fn online(client_id: OwnerId, display_name: impl Into<String>) -> Self {
        Self {
            client_id,
            display_name: display_name.into(),
            online: true,
            last_seen: Utc::now(),
            cursor: None,
            currently_editing: None,
        }
    }

    /// Age of the record relative to `now`, clamped at zero.
    pub fn age(&self, now: Timestamp) -> std::time::Duration {
        (now - self.last_seen).to_std().unwrap_or_default()
    }
}

/// The whole presence channel keyed by client id.
pub type PresenceMap = BTreeMap<OwnerId, PresenceRecord>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn age_is_clamped_for_future_timestamps() {
        let mut record = PresenceRecord::online(OwnerId::from("a"), "A");
        record.last_seen = Utc::now() + chrono::Duration::seconds(30);
        assert_eq!(record.age(Utc::now()), std::time::Duration::ZERO);
    }

    #[test]
    fn age_measures_elapsed_time() {
        let mut record = PresenceRecord::online(OwnerId::from("a"), "A");
        let now = Utc::now();
        record.last_seen = now - chrono::Duration::seconds(20);
        assert_eq!(record.age(now).as_secs(), 20);
    }
}
