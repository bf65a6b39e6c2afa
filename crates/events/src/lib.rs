//! Canvas collaboration event bus.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`CanvasEvent`]: the lock, reaping, batching and failure events the
//!   collaboration layer emits for UI feedback and operational logging.

pub mod bus;

pub use bus::{CanvasEvent, EventBus, EventEnvelope};
