//! [`PresenceChannel`] over the `client_presence` table.
//!
//! Heartbeats upsert the client's row; departure flags it offline. The
//! change stream is produced by polling, publishing only when the table
//! contents differ from the last published map.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use canvas_core::presence::{Cursor, PresenceMap, PresenceRecord};
use canvas_core::types::{OwnerId, ShapeId, Timestamp};
use canvas_store::{PresenceChannel, PresenceError};
use sqlx::{FromRow, PgPool};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::DbError;

/// Column list for `client_presence` queries.
const PRESENCE_COLUMNS: &str = "client_id, display_name, online, last_seen, \
                                cursor_x, cursor_y, currently_editing";

/// A row from the `client_presence` table.
#[derive(Debug, Clone, FromRow)]
pub struct PresenceRow {
    pub client_id: String,
    pub display_name: String,
    pub online: bool,
    pub last_seen: Timestamp,
    pub cursor_x: Option<f64>,
    pub cursor_y: Option<f64>,
    pub currently_editing: Option<String>,
}

impl From<PresenceRow> for PresenceRecord {
    fn from(row: PresenceRow) -> Self {
        let cursor = match (row.cursor_x, row.cursor_y) {
            (Some(x), Some(y)) => Some(Cursor { x, y }),
            _ => None,
        };
        PresenceRecord {
            client_id: OwnerId::from(row.client_id),
            display_name: row.display_name,
            online: row.online,
            last_seen: row.last_seen,
            cursor,
            currently_editing: row.currently_editing.map(ShapeId::from),
        }
    }
}

async fn load(pool: &PgPool) -> Result<PresenceMap, DbError> {
    let query = format!("SELECT {PRESENCE_COLUMNS} FROM client_presence");
    let rows = sqlx::query_as::<_, PresenceRow>(&query)
        .fetch_all(pool)
        .await?;
    Ok(rows
        .into_iter()
        .map(PresenceRecord::from)
        .map(|record| (record.client_id.clone(), record))
        .collect())
}

// ---------------------------------------------------------------------------
// PgPresence
// ---------------------------------------------------------------------------

/// Postgres-backed presence channel.
pub struct PgPresence {
    pool: PgPool,
    changes: watch::Receiver<Arc<PresenceMap>>,
    cancel: CancellationToken,
}

impl PgPresence {
    /// Load the current records and start polling every `poll_interval`.
    pub async fn connect(pool: PgPool, poll_interval: Duration) -> Result<Self, PresenceError> {
        let initial = load(&pool).await?;
        let (tx, rx) = watch::channel(Arc::new(initial));
        let cancel = CancellationToken::new();
        tokio::spawn(poll(pool.clone(), tx, poll_interval, cancel.clone()));

        tracing::info!(poll_ms = poll_interval.as_millis() as u64, "Presence channel connected");
        Ok(Self {
            pool,
            changes: rx,
            cancel,
        })
    }
}

impl Drop for PgPresence {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn poll(
    pool: PgPool,
    changes: watch::Sender<Arc<PresenceMap>>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Presence poller cancelled");
                break;
            }
            _ = interval.tick() => {
                match load(&pool).await {
                    Ok(map) => {
                        changes.send_if_modified(|current| {
                            if **current == map {
                                return false;
                            }
                            *current = Arc::new(map);
                            true
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to poll presence"),
                }
            }
        }
    }
}

#[async_trait]
impl PresenceChannel for PgPresence {
    async fn announce(&self, record: PresenceRecord) -> Result<(), PresenceError> {
        sqlx::query(
            "INSERT INTO client_presence \
                 (client_id, display_name, online, last_seen, cursor_x, cursor_y, currently_editing) \
             VALUES ($1, $2, TRUE, NOW(), $3, $4, $5) \
             ON CONFLICT (client_id) DO UPDATE SET \
                 display_name = EXCLUDED.display_name, online = TRUE, last_seen = NOW(), \
                 cursor_x = EXCLUDED.cursor_x, cursor_y = EXCLUDED.cursor_y, \
                 currently_editing = EXCLUDED.currently_editing",
        )
        .bind(record.client_id.as_str())
        .bind(&record.display_name)
        .bind(record.cursor.map(|c| c.x))
        .bind(record.cursor.map(|c| c.y))
        .bind(record.currently_editing.as_ref().map(ShapeId::as_str))
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(())
    }

    async fn depart(&self, client_id: &OwnerId) -> Result<(), PresenceError> {
        let result = sqlx::query("UPDATE client_presence SET online = FALSE WHERE client_id = $1")
            .bind(client_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        tracing::debug!(
            client_id = %client_id,
            found = result.rows_affected() > 0,
            "Client departed",
        );
        Ok(())
    }

    async fn snapshot(&self) -> Result<PresenceMap, PresenceError> {
        Ok(load(&self.pool).await?)
    }

    fn subscribe(&self) -> watch::Receiver<Arc<PresenceMap>> {
        self.changes.clone()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn row() -> PresenceRow {
        PresenceRow {
            client_id: "alice".into(),
            display_name: "Alice".into(),
            online: true,
            last_seen: Utc::now(),
            cursor_x: Some(10.0),
            cursor_y: Some(20.0),
            currently_editing: Some("shape-1".into()),
        }
    }

    #[test]
    fn row_converts_to_record() {
        let record = PresenceRecord::from(row());
        assert_eq!(record.client_id, OwnerId::from("alice"));
        assert_eq!(record.cursor, Some(Cursor { x: 10.0, y: 20.0 }));
        assert_eq!(record.currently_editing, Some(ShapeId::from("shape-1")));
    }

    #[test]
    fn half_a_cursor_is_no_cursor() {
        let record = PresenceRecord::from(PresenceRow {
            cursor_y: None,
            ..row()
        });
        assert_eq!(record.cursor, None);
    }
}
