//! Adapter boundary for the durable shape store and the presence channel.
//!
//! - [`ShapeStore`]: queryable shape collection with optimistic-concurrency
//!   transactions, multi-document batch writes and a live snapshot stream.
//! - [`PresenceChannel`]: ephemeral per-client liveness registry with a
//!   change stream.
//! - [`MemoryStore`] / [`MemoryPresence`]: in-process implementations used
//!   by tests and single-process deployments.

pub mod error;
pub mod memory;
pub mod presence;
pub mod shapes;

pub use error::{PresenceError, StoreError};
pub use memory::{MemoryStore, StoreStats};
pub use presence::{DisconnectBehavior, MemoryPresence, PresenceChannel, PresenceSession};
pub use shapes::{Decision, ShapeStore, Snapshot, TxResult, Versioned, WriteAck, WriteOp};
