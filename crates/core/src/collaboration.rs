//! Real-time collaboration constants and validation.
//!
//! This module lives in `core` (zero internal deps) so that the client
//! collaboration layer, the store adapters and the reaper daemon all
//! reference the same overlay lifetimes, debounce windows and presence
//! timings.

use std::time::Duration;

use crate::error::CoreError;
use crate::types::OwnerId;

// ---------------------------------------------------------------------------
// Optimistic overlay
// ---------------------------------------------------------------------------

/// How long a local optimistic entry shields a shape from stale snapshots.
pub const OVERLAY_TTL_MS: u64 = 2_000;

// ---------------------------------------------------------------------------
// Batched creation
// ---------------------------------------------------------------------------

/// Trailing debounce window for the batched creation pipeline.
pub const BATCH_DEBOUNCE_MS: u64 = 50;

/// Longest a pending creation waits for its batch, however steady the
/// stream of further creations.
pub const BATCH_MAX_WAIT_MS: u64 = 250;

/// Largest number of documents sent in a single batch write.
pub const MAX_BATCH_SIZE: usize = 500;

// ---------------------------------------------------------------------------
// Action timeouts
// ---------------------------------------------------------------------------

/// Timeout applied to single-shape actions (lock, unlock, update, delete).
pub const SINGLE_ACTION_TIMEOUT_SECS: u64 = 3;

/// Timeout applied to bulk actions (multi-shape updates, clear-all, reaping).
pub const BULK_ACTION_TIMEOUT_SECS: u64 = 10;

// ---------------------------------------------------------------------------
// Store transactions
// ---------------------------------------------------------------------------

/// Attempts a single optimistic-concurrency transaction makes before it
/// reports contention.
pub const MAX_TX_ATTEMPTS: u32 = 5;

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// Maximum number of actions kept on the undo stack.
pub const MAX_HISTORY_DEPTH: usize = 100;

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

/// How often a connected client renews its presence record.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 3;

/// Presence records not renewed for this long are treated as absent.
pub const PRESENCE_STALE_SECS: u64 = 15;

/// How long a client must stay absent before its locks are reaped.
pub const REAPER_GRACE_SECS: u64 = 5;

/// How often the reaper re-evaluates suspects even without presence changes.
pub const REAPER_POLL_MS: u64 = 1_000;

pub fn overlay_ttl() -> Duration {
    Duration::from_millis(OVERLAY_TTL_MS)
}

pub fn batch_debounce() -> Duration {
    Duration::from_millis(BATCH_DEBOUNCE_MS)
}

pub fn batch_max_wait() -> Duration {
    Duration::from_millis(BATCH_MAX_WAIT_MS)
}

pub fn single_action_timeout() -> Duration {
    Duration::from_secs(SINGLE_ACTION_TIMEOUT_SECS)
}

pub fn bulk_action_timeout() -> Duration {
    Duration::from_secs(BULK_ACTION_TIMEOUT_SECS)
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

/// Validate an actor id before it is written into lock fields.
pub fn validate_owner_id(owner: &OwnerId) -> Result<(), CoreError> {
    let raw = owner.as_str();
    if raw.trim().is_empty() {
        return Err(CoreError::Validation("owner id must not be empty".into()));
    }
    if raw.len() > 128 {
        return Err(CoreError::Validation(format!(
            "owner id must be at most 128 characters, got {}",
            raw.len()
        )));
    }
    Ok(())
}

/// Validate a `#rrggbb` colour used for lock badges and fills.
pub fn validate_color(color: &str) -> Result<(), CoreError> {
    let hex = color
        .strip_prefix('#')
        .ok_or_else(|| CoreError::Validation(format!("colour '{color}' must start with '#'")))?;
    if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(CoreError::Validation(format!(
            "colour '{color}' must be of the form #rrggbb"
        )));
    }
    Ok(())
}
