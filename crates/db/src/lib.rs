//! Postgres adapters for the shared canvas.
//!
//! - [`PgShapeStore`]: the shape collection, with change notifications via
//!   `LISTEN shapes_changed`.
//! - [`PgPresence`]: the presence channel over `client_presence`.

pub mod error;
pub mod presence;
pub mod shapes;

use sqlx::postgres::PgPoolOptions;

pub use error::DbError;
pub use presence::PgPresence;
pub use shapes::PgShapeStore;

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Round-trip a trivial query to confirm the database is reachable.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply the embedded migrations.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
