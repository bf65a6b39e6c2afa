//! Domain types shared by every canvas crate.
//!
//! This crate has zero internal dependencies so that the store adapters, the
//! collaboration layer and the reaper daemon all agree on the same shape
//! model, lock constants and retry classification.

pub mod collaboration;
pub mod error;
pub mod presence;
pub mod retry;
pub mod shape;
pub mod types;
