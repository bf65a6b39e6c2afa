//! Lock reaper daemon: runs [`canvas_collab::LockReaper`] against Postgres
//! and serves a health endpoint.

pub mod config;
pub mod health;
