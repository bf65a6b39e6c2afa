use std::time::Duration;

use canvas_core::error::CoreError;
use canvas_core::types::{OwnerId, ShapeId};
use canvas_store::{PresenceError, StoreError};

/// Errors surfaced by the collaboration layer.
///
/// Soft conflicts on lock calls are typed outcomes
/// ([`AcquireOutcome`](crate::locks::AcquireOutcome),
/// [`ReleaseOutcome`](crate::locks::ReleaseOutcome)), not errors.
/// [`LockedByOther`](CollabError::LockedByOther) is raised only when a
/// gated edit targets a shape somebody else holds.
#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Presence(#[from] PresenceError),

    #[error("{operation} timed out after {}ms", after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Shape not found: {0}")]
    NotFound(ShapeId),

    #[error("Shape {shape_id} is locked by {held_by}")]
    LockedByOther { shape_id: ShapeId, held_by: OwnerId },

    #[error("Batch pipeline is no longer running")]
    PipelineClosed,
}

/// Convenience alias for collaboration-layer results.
pub type CollabResult<T> = Result<T, CollabError>;
