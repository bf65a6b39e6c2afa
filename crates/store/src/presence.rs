//! Presence channel contract and its in-memory implementation.
//!
//! The in-memory channel models the transport's disconnect hook as the drop
//! of a [`PresenceSession`]: when the session guard goes away (the
//! connection closed, the task panicked, the client was dropped), the
//! record is removed or flagged offline without any cooperation from the
//! client.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use canvas_core::presence::{Cursor, PresenceMap, PresenceRecord};
use canvas_core::types::{OwnerId, ShapeId};
use chrono::Utc;
use tokio::sync::watch;

use crate::error::PresenceError;

/// Ephemeral per-client liveness registry.
#[async_trait]
pub trait PresenceChannel: Send + Sync {
    /// Insert or renew a client's record; `last_seen` is refreshed.
    async fn announce(&self, record: PresenceRecord) -> Result<(), PresenceError>;

    /// Mark a client as gone (explicit sign-out or a fired disconnect hook).
    async fn depart(&self, client_id: &OwnerId) -> Result<(), PresenceError>;

    /// Current contents of the channel.
    async fn snapshot(&self) -> Result<PresenceMap, PresenceError>;

    /// Change stream. Each value supersedes the previous one.
    fn subscribe(&self) -> watch::Receiver<Arc<PresenceMap>>;
}

/// What the disconnect hook does to a client's record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisconnectBehavior {
    /// Delete the record.
    #[default]
    Remove,
    /// Keep the record with `online = false`.
    FlagOffline,
}

struct Shared {
    records: Mutex<PresenceMap>,
    changes: watch::Sender<Arc<PresenceMap>>,
    on_disconnect: DisconnectBehavior,
}

impl Shared {
    fn mutate(&self, f: impl FnOnce(&mut PresenceMap)) {
        let Ok(mut records) = self.records.lock() else {
            tracing::error!("Presence map lock poisoned");
            return;
        };
        f(&mut records);
        self.changes.send_replace(Arc::new(records.clone()));
    }

    fn disconnect(&self, client_id: &OwnerId) {
        let behavior = self.on_disconnect;
        self.mutate(|records| match behavior {
            DisconnectBehavior::Remove => {
                records.remove(client_id);
            }
            DisconnectBehavior::FlagOffline => {
                if let Some(record) = records.get_mut(client_id) {
                    record.online = false;
                }
            }
        });
        tracing::debug!(client_id = %client_id, ?behavior, "Presence disconnect hook fired");
    }
}

/// Presence channel held in process memory.
#[derive(Clone)]
pub struct MemoryPresence {
    shared: Arc<Shared>,
}

impl MemoryPresence {
    pub fn new(on_disconnect: DisconnectBehavior) -> Self {
        let (changes, _) = watch::channel(Arc::new(PresenceMap::new()));
        Self {
            shared: Arc::new(Shared {
                records: Mutex::new(PresenceMap::new()),
                changes,
                on_disconnect,
            }),
        }
    }

    /// Register a connected client and return the guard whose drop fires the
    /// disconnect hook.
    pub fn connect(&self, client_id: OwnerId, display_name: impl Into<String>) -> PresenceSession {
        let record = PresenceRecord::online(client_id.clone(), display_name);
        self.shared.mutate(|records| {
            records.insert(client_id.clone(), record);
        });
        tracing::debug!(client_id = %client_id, "Presence session connected");
        PresenceSession {
            shared: Arc::clone(&self.shared),
            client_id,
        }
    }

    /// Push a client's `last_seen` into the past, simulating missed
    /// heartbeats.
    pub fn backdate(&self, client_id: &OwnerId, by: chrono::Duration) {
        self.shared.mutate(|records| {
            if let Some(record) = records.get_mut(client_id) {
                record.last_seen -= by;
            }
        });
    }
}

impl Default for MemoryPresence {
    fn default() -> Self {
        Self::new(DisconnectBehavior::default())
    }
}

#[async_trait]
impl PresenceChannel for MemoryPresence {
    async fn announce(&self, mut record: PresenceRecord) -> Result<(), PresenceError> {
        record.online = true;
        record.last_seen = Utc::now();
        self.shared.mutate(|records| {
            records.insert(record.client_id.clone(), record);
        });
        Ok(())
    }

    async fn depart(&self, client_id: &OwnerId) -> Result<(), PresenceError> {
        self.shared.disconnect(client_id);
        Ok(())
    }

    async fn snapshot(&self) -> Result<PresenceMap, PresenceError> {
        self.shared
            .records
            .lock()
            .map(|records| records.clone())
            .map_err(|_| PresenceError::Unavailable("presence map lock poisoned".into()))
    }

    fn subscribe(&self) -> watch::Receiver<Arc<PresenceMap>> {
        self.shared.changes.subscribe()
    }
}

/// A live connection to a [`MemoryPresence`] channel.
///
/// Dropping the session fires the disconnect hook.
pub struct PresenceSession {
    shared: Arc<Shared>,
    client_id: OwnerId,
}

impl PresenceSession {
    pub fn client_id(&self) -> &OwnerId {
        &self.client_id
    }

    /// Renew `last_seen` and publish the client's cursor and editing target.
    pub fn heartbeat(&self, cursor: Option<Cursor>, currently_editing: Option<ShapeId>) {
        let client_id = self.client_id.clone();
        self.shared.mutate(|records| {
            if let Some(record) = records.get_mut(&client_id) {
                record.online = true;
                record.last_seen = Utc::now();
                record.cursor = cursor;
                record.currently_editing = currently_editing;
            }
        });
    }
}

impl Drop for PresenceSession {
    fn drop(&mut self) {
        self.shared.disconnect(&self.client_id);
    }
}
