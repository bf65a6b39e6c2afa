//! Mapping from driver failures onto the adapter error types.

use canvas_store::{PresenceError, StoreError};

/// A failure inside the Postgres adapters, before it is classified for the
/// collaboration layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    /// A stored JSON body did not decode into a shape.
    #[error("Malformed row {id}: {reason}")]
    Malformed { id: String, reason: String },
}

/// Coarse classification used to pick the adapter error variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection trouble; worth retrying.
    Unavailable,
    /// Serialization failure or deadlock; worth retrying.
    Transient,
    PermissionDenied,
    InvalidArgument,
    Other,
}

/// Classify a Postgres SQLSTATE code.
pub fn class_for_code(code: &str) -> ErrorClass {
    match code {
        "40001" | "40P01" | "55P03" => ErrorClass::Transient,
        "42501" | "28000" | "28P01" => ErrorClass::PermissionDenied,
        "57P01" | "57P02" | "57P03" | "53300" => ErrorClass::Unavailable,
        c if c.starts_with("08") => ErrorClass::Unavailable,
        c if c.starts_with("23") || c.starts_with("22") => ErrorClass::InvalidArgument,
        _ => ErrorClass::Other,
    }
}

pub fn classify(err: &sqlx::Error) -> ErrorClass {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ErrorClass::Unavailable,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| class_for_code(&code))
            .unwrap_or(ErrorClass::Other),
        sqlx::Error::Encode(_) => ErrorClass::InvalidArgument,
        _ => ErrorClass::Other,
    }
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Malformed { id, reason } => StoreError::Malformed { id, reason },
            DbError::Sqlx(e) => {
                let message = e.to_string();
                match classify(&e) {
                    ErrorClass::Unavailable | ErrorClass::Transient | ErrorClass::Other => {
                        StoreError::Unavailable(message)
                    }
                    ErrorClass::PermissionDenied => StoreError::PermissionDenied(message),
                    ErrorClass::InvalidArgument => StoreError::InvalidArgument(message),
                }
            }
        }
    }
}

impl From<DbError> for PresenceError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Malformed { id, reason } => PresenceError::Malformed {
                client_id: id,
                reason,
            },
            DbError::Sqlx(e) => PresenceError::Unavailable(e.to_string()),
        }
    }
}
