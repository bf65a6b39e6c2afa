use crate::types::ShapeId;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Shape not found: {0}")]
    NotFound(ShapeId),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
