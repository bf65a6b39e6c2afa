//! Real-time collaboration layer for the shared canvas.
//!
//! - [`locks`]: per-shape advisory locks over optimistic transactions.
//! - [`state`]: the local view with its optimistic overlay.
//! - [`history`]: undo/redo across temporary-to-durable id swaps.
//! - [`batch`]: debounced multi-shape creation.
//! - [`reaper`]: releases locks of clients that disappeared.
//! - [`client`]: the per-user facade combining all of the above.

pub mod actions;
pub mod batch;
pub mod client;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod history;
pub mod locks;
pub mod reaper;
pub mod state;

pub use client::{BulkReport, CanvasClient};
pub use config::{CollabConfig, ReaperConfig};
pub use error::{CollabError, CollabResult};
pub use locks::{AcquireOutcome, LockManager, ReleaseOutcome, ReleaseSummary};
pub use reaper::{LockReaper, ReaperState, ReaperStats};
