//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is the publish/subscribe hub for [`CanvasEvent`]s. It is
//! designed to be shared via `Arc<EventBus>` between the client facade, the
//! lock reaper and whatever surfaces feedback to users.

use canvas_core::types::{OwnerId, ShapeId, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// CanvasEvent
// ---------------------------------------------------------------------------

/// Something the collaboration layer wants observers to know about.
///
/// Serialized as JSON with an internally-tagged `"type"` discriminator so
/// that a frontend can route events by type string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum CanvasEvent {
    #[serde(rename = "lock.acquired")]
    LockAcquired { shape_id: ShapeId, owner: OwnerId },

    /// A lock request lost to another holder.
    #[serde(rename = "lock.denied")]
    LockDenied {
        shape_id: ShapeId,
        owner: OwnerId,
        held_by: OwnerId,
    },

    #[serde(rename = "lock.released")]
    LockReleased { shape_id: ShapeId, owner: OwnerId },

    /// The reaper released every lock of a client it considers gone.
    #[serde(rename = "owner.reaped")]
    OwnerReaped {
        owner: OwnerId,
        released: Vec<ShapeId>,
    },

    /// A batch of locally created shapes reached the store.
    #[serde(rename = "batch.flushed")]
    BatchFlushed { created: usize, rolled_back: usize },

    /// A background durable write failed after retries.
    #[serde(rename = "write.failed")]
    WriteFailed { shape_id: ShapeId, error: String },

    #[serde(rename = "action.timed_out")]
    ActionTimedOut { operation: String, after_ms: u64 },
}

/// A [`CanvasEvent`] stamped with its emission time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    #[serde(flatten)]
    pub event: CanvasEvent,
    pub timestamp: Timestamp,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// When the buffer is full, the oldest un-consumed events are dropped and
/// slow receivers observe `RecvError::Lagged`.
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped.
    pub fn publish(&self, event: CanvasEvent) {
        tracing::trace!(?event, "Publishing canvas event");
        // Ignore the SendError; it only means there are zero receivers.
        let _ = self.sender.send(EventEnvelope {
            event,
            timestamp: Utc::now(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
