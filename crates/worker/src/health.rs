use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::State;
use axum::{routing::get, Json, Router};
use canvas_collab::ReaperStats;
use canvas_db::DbPool;
use serde::Serialize;

/// Shared state for the health route.
#[derive(Clone)]
pub struct HealthState {
    pub pool: DbPool,
    pub stats: Arc<ReaperStats>,
}

/// Health check response payload.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall service status.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Whether the database is reachable.
    pub db_healthy: bool,
    pub clients_reaped: u64,
    pub locks_released: u64,
    pub failed_reaps: u64,
}

impl HealthResponse {
    pub fn new(db_healthy: bool, stats: &ReaperStats) -> Self {
        Self {
            status: if db_healthy { "ok" } else { "degraded" },
            version: env!("CARGO_PKG_VERSION"),
            db_healthy,
            clients_reaped: stats.clients_reaped.load(Ordering::Relaxed),
            locks_released: stats.locks_released.load(Ordering::Relaxed),
            failed_reaps: stats.failed_reaps.load(Ordering::Relaxed),
        }
    }
}

/// GET /health -- returns daemon, database and reaper health.
async fn health_check(State(state): State<HealthState>) -> Json<HealthResponse> {
    let db_healthy = canvas_db::health_check(&state.pool).await.is_ok();
    Json(HealthResponse::new(db_healthy, &state.stats))
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .with_state(state)
}
