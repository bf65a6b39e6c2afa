use canvas_core::retry::Retryable;
use canvas_core::types::ShapeId;

/// Failures reported by a [`ShapeStore`](crate::ShapeStore).
///
/// Expected conflict outcomes (a lock held by someone else, a release by a
/// non-holder) are never errors; they surface as aborted transactions.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// The backing service could not be reached or timed out.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// An optimistic transaction kept losing its compare-and-put.
    #[error("Transaction on {id} gave up after {attempts} conflicting attempts")]
    Contention { id: ShapeId, attempts: u32 },

    #[error("Shape not found: {0}")]
    NotFound(ShapeId),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Account disabled: {0}")]
    AccountDisabled(String),

    /// A stored document could not be decoded.
    #[error("Malformed document {id}: {reason}")]
    Malformed { id: String, reason: String },
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::Contention { .. }
        )
    }
}

/// Failures reported by a [`PresenceChannel`](crate::PresenceChannel).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PresenceError {
    #[error("Presence channel unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed presence record for {client_id}: {reason}")]
    Malformed { client_id: String, reason: String },
}

impl Retryable for PresenceError {
    fn is_retryable(&self) -> bool {
        matches!(self, PresenceError::Unavailable(_))
    }
}
