//! [`ShapeStore`] over the `shapes` table.
//!
//! Each row keeps the whole shape as JSONB plus a `version` used for
//! compare-and-put. A statement-level trigger issues `pg_notify` on
//! `shapes_changed`; a listener task reloads the collection on every
//! notification and publishes it on the snapshot `watch` channel.

use std::sync::Arc;

use async_trait::async_trait;
use canvas_core::retry::{next_delay, RetryPolicy};
use canvas_core::shape::{Shape, ShapePatch};
use canvas_core::types::{OwnerId, ShapeId};
use canvas_store::{
    Decision, ShapeStore, Snapshot, StoreError, TxResult, Versioned, WriteAck, WriteOp,
};
use sqlx::postgres::PgListener;
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::DbError;

/// Notification channel raised by the `shapes` trigger.
pub const SHAPES_CHANNEL: &str = "shapes_changed";

/// Column list for `shapes` queries.
const SHAPE_COLUMNS: &str = "id, version, body";

const ORDER_BY: &str = "ORDER BY created_at, seq";

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

/// A row from the `shapes` table.
#[derive(Debug, Clone, FromRow)]
pub struct ShapeRow {
    pub id: String,
    pub version: i64,
    pub body: serde_json::Value,
}

impl ShapeRow {
    /// Decode the JSON body. The row key wins over any id inside the body.
    pub fn decode(self) -> Result<Versioned, DbError> {
        let mut shape: Shape =
            serde_json::from_value(self.body).map_err(|e| DbError::Malformed {
                id: self.id.clone(),
                reason: e.to_string(),
            })?;
        let version = u64::try_from(self.version).map_err(|_| DbError::Malformed {
            id: self.id.clone(),
            reason: format!("negative version {}", self.version),
        })?;
        shape.id = ShapeId::from(self.id);
        Ok(Versioned { shape, version })
    }
}

fn decode_all(rows: Vec<ShapeRow>) -> Result<Vec<Shape>, DbError> {
    rows.into_iter()
        .map(|row| row.decode().map(|v| v.shape))
        .collect()
}

/// Convert a caller-supplied version into the column type.
fn version_param(version: u64) -> Result<i64, DbError> {
    i64::try_from(version).map_err(|_| DbError::Malformed {
        id: String::new(),
        reason: format!("version {version} out of range"),
    })
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

async fn fetch_one(conn: &mut PgConnection, id: &ShapeId) -> Result<Option<Versioned>, DbError> {
    let query = format!("SELECT {SHAPE_COLUMNS} FROM shapes WHERE id = $1");
    let row = sqlx::query_as::<_, ShapeRow>(&query)
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    row.map(ShapeRow::decode).transpose()
}

async fn fetch_all(pool: &PgPool) -> Result<Vec<Shape>, DbError> {
    let query = format!("SELECT {SHAPE_COLUMNS} FROM shapes {ORDER_BY}");
    let rows = sqlx::query_as::<_, ShapeRow>(&query).fetch_all(pool).await?;
    decode_all(rows)
}

/// Insert a new row. Returns `false` if the id is already taken.
async fn insert(conn: &mut PgConnection, shape: &Shape) -> Result<bool, DbError> {
    let result = sqlx::query(
        "INSERT INTO shapes (id, locked_by, body, created_at) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(shape.id.as_str())
    .bind(shape.locked_by.as_ref().map(OwnerId::as_str))
    .bind(Json(shape))
    .bind(shape.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Replace the row at `expected` version. Returns `false` on a stale version.
async fn replace(conn: &mut PgConnection, shape: &Shape, expected: u64) -> Result<bool, DbError> {
    let result = sqlx::query(
        "UPDATE shapes SET body = $2, locked_by = $3, version = version + 1, updated_at = NOW() \
         WHERE id = $1 AND version = $4",
    )
    .bind(shape.id.as_str())
    .bind(Json(shape))
    .bind(shape.locked_by.as_ref().map(OwnerId::as_str))
    .bind(version_param(expected)?)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

async fn upsert(conn: &mut PgConnection, shape: &Shape) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO shapes (id, locked_by, body, created_at) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (id) DO UPDATE SET \
             body = EXCLUDED.body, locked_by = EXCLUDED.locked_by, \
             version = shapes.version + 1, updated_at = NOW()",
    )
    .bind(shape.id.as_str())
    .bind(shape.locked_by.as_ref().map(OwnerId::as_str))
    .bind(Json(shape))
    .bind(shape.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn remove(conn: &mut PgConnection, id: &ShapeId) -> Result<bool, DbError> {
    let result = sqlx::query("DELETE FROM shapes WHERE id = $1")
        .bind(id.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Patch a row under a row lock, inside the caller's transaction.
async fn patch_locked(
    conn: &mut PgConnection,
    id: &ShapeId,
    patch: &ShapePatch,
    actor: &OwnerId,
) -> Result<Option<Shape>, DbError> {
    let query = format!("SELECT {SHAPE_COLUMNS} FROM shapes WHERE id = $1 FOR UPDATE");
    let Some(row) = sqlx::query_as::<_, ShapeRow>(&query)
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await?
    else {
        return Ok(None);
    };
    let current = row.decode()?;
    let mut next = current.shape;
    patch.apply_to(&mut next);
    next.touch(actor);
    replace(conn, &next, current.version).await?;
    Ok(Some(next))
}

/// Apply one batch member. Errors are reported per member.
async fn apply_op(conn: &mut PgConnection, op: WriteOp) -> Result<WriteAck, StoreError> {
    match op {
        WriteOp::Create { temp_id, mut shape } => {
            shape.id = ShapeId::durable();
            if !insert(conn, &shape).await? {
                return Err(StoreError::InvalidArgument(format!(
                    "durable id {} already taken",
                    shape.id
                )));
            }
            Ok(WriteAck::Created {
                temp_id,
                id: shape.id,
            })
        }
        WriteOp::Update { id, patch, actor } => match patch_locked(conn, &id, &patch, &actor).await? {
            Some(_) => Ok(WriteAck::Updated(id)),
            None => Err(StoreError::NotFound(id)),
        },
        WriteOp::Delete { id } => {
            remove(conn, &id).await?;
            Ok(WriteAck::Deleted(id))
        }
    }
}

// ---------------------------------------------------------------------------
// PgShapeStore
// ---------------------------------------------------------------------------

/// Postgres-backed shape collection.
pub struct PgShapeStore {
    pool: PgPool,
    snapshots: watch::Receiver<Arc<Snapshot>>,
    cancel: CancellationToken,
}

impl PgShapeStore {
    /// Load the collection and start the change listener.
    pub async fn connect(pool: PgPool) -> Result<Self, StoreError> {
        let shapes = fetch_all(&pool).await?;
        let (tx, rx) = watch::channel(Arc::new(Snapshot {
            revision: 0,
            shapes,
        }));
        let cancel = CancellationToken::new();
        tokio::spawn(run_listener(pool.clone(), tx, cancel.clone()));

        tracing::info!(channel = SHAPES_CHANNEL, "Shape store connected");
        Ok(Self {
            pool,
            snapshots: rx,
            cancel,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl Drop for PgShapeStore {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Reload the collection whenever the trigger fires. Reconnects with
/// exponential backoff when the listener connection drops.
async fn run_listener(
    pool: PgPool,
    snapshots: watch::Sender<Arc<Snapshot>>,
    cancel: CancellationToken,
) {
    let backoff = RetryPolicy::default();
    let mut delay = backoff.initial_delay;
    let mut revision = 0u64;

    loop {
        let mut listener = match connect_listener(&pool).await {
            Ok(listener) => {
                delay = backoff.initial_delay;
                listener
            }
            Err(e) => {
                tracing::warn!(error = %e, delay_ms = delay.as_millis() as u64, "Shape listener connect failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = next_delay(delay, &backoff);
                continue;
            }
        };

        // Writes may have landed while we were not listening.
        publish(&pool, &snapshots, &mut revision).await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Shape listener cancelled");
                    return;
                }
                notification = listener.recv() => match notification {
                    Ok(_) => publish(&pool, &snapshots, &mut revision).await,
                    Err(e) => {
                        tracing::warn!(error = %e, "Shape listener lost its connection");
                        break;
                    }
                }
            }
        }
    }
}

async fn connect_listener(pool: &PgPool) -> Result<PgListener, sqlx::Error> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(SHAPES_CHANNEL).await?;
    Ok(listener)
}

async fn publish(pool: &PgPool, snapshots: &watch::Sender<Arc<Snapshot>>, revision: &mut u64) {
    match fetch_all(pool).await {
        Ok(shapes) => {
            *revision += 1;
            tracing::trace!(revision = *revision, shapes = shapes.len(), "Publishing shape snapshot");
            snapshots.send_replace(Arc::new(Snapshot {
                revision: *revision,
                shapes,
            }));
        }
        Err(e) => tracing::error!(error = %e, "Failed to reload shapes after change"),
    }
}

#[async_trait]
impl ShapeStore for PgShapeStore {
    async fn read_versioned(&self, id: &ShapeId) -> Result<Option<Versioned>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        Ok(fetch_one(&mut conn, id).await?)
    }

    async fn compare_and_put(
        &self,
        id: &ShapeId,
        expected: Option<u64>,
        next: &Shape,
    ) -> Result<bool, StoreError> {
        if &next.id != id {
            return Err(StoreError::InvalidArgument(format!(
                "document id {} does not match key {id}",
                next.id
            )));
        }
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let written = match expected {
            None => insert(&mut conn, next).await?,
            Some(version) => replace(&mut conn, next, version).await?,
        };
        Ok(written)
    }

    async fn create(&self, mut shape: Shape) -> Result<Shape, StoreError> {
        shape.id = ShapeId::durable();
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        if !insert(&mut conn, &shape).await? {
            return Err(StoreError::InvalidArgument(format!(
                "durable id {} already taken",
                shape.id
            )));
        }
        tracing::debug!(shape_id = %shape.id, "Shape created");
        Ok(shape)
    }

    async fn put(&self, shape: Shape) -> Result<(), StoreError> {
        if shape.id.is_temporary() {
            return Err(StoreError::InvalidArgument(format!(
                "cannot persist temporary id {}",
                shape.id
            )));
        }
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        Ok(upsert(&mut conn, &shape).await?)
    }

    async fn update(
        &self,
        id: &ShapeId,
        patch: &ShapePatch,
        actor: &OwnerId,
    ) -> Result<Shape, StoreError> {
        let decide = |current: Option<&Shape>| match current {
            Some(shape) => {
                let mut next = shape.clone();
                patch.apply_to(&mut next);
                next.touch(actor);
                Decision::Put(next)
            }
            None => Decision::Abort,
        };
        match self.transact(id, &decide).await? {
            TxResult::Committed(shape) => Ok(shape),
            TxResult::Aborted(_) => Err(StoreError::NotFound(id.clone())),
        }
    }

    async fn delete(&self, id: &ShapeId) -> Result<bool, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        Ok(remove(&mut conn, id).await?)
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM shapes")
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        tracing::info!(removed = result.rows_affected(), "All shapes deleted");
        Ok(result.rows_affected())
    }

    /// One transaction; each member runs inside its own savepoint so a
    /// failing member is rolled back without affecting the others.
    async fn batch_write(
        &self,
        ops: Vec<WriteOp>,
    ) -> Result<Vec<Result<WriteAck, StoreError>>, StoreError> {
        let count = ops.len();
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        let mut results = Vec::with_capacity(count);

        for op in ops {
            sqlx::query("SAVEPOINT batch_member")
                .execute(&mut *tx)
                .await
                .map_err(DbError::from)?;
            let target = op.target().clone();
            match apply_op(&mut *tx, op).await {
                Ok(ack) => {
                    sqlx::query("RELEASE SAVEPOINT batch_member")
                        .execute(&mut *tx)
                        .await
                        .map_err(DbError::from)?;
                    results.push(Ok(ack));
                }
                Err(e) => {
                    tracing::warn!(shape_id = %target, error = %e, "Batch member rejected");
                    sqlx::query("ROLLBACK TO SAVEPOINT batch_member")
                        .execute(&mut *tx)
                        .await
                        .map_err(DbError::from)?;
                    results.push(Err(e));
                }
            }
        }

        tx.commit().await.map_err(DbError::from)?;
        tracing::debug!(members = count, "Batch write committed");
        Ok(results)
    }

    async fn list(&self) -> Result<Vec<Shape>, StoreError> {
        Ok(fetch_all(&self.pool).await?)
    }

    async fn locked_by(&self, owner: &OwnerId) -> Result<Vec<Shape>, StoreError> {
        let query = format!("SELECT {SHAPE_COLUMNS} FROM shapes WHERE locked_by = $1 {ORDER_BY}");
        let rows = sqlx::query_as::<_, ShapeRow>(&query)
            .bind(owner.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(decode_all(rows)?)
    }

    fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshots.clone()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use canvas_core::shape::{ShapeKind, ShapeSpec};

    use super::*;

    fn body(id: &str) -> serde_json::Value {
        let spec = ShapeSpec::new(ShapeKind::Ellipse, 1.0, 2.0, 3.0, 4.0);
        serde_json::to_value(Shape::from_spec(ShapeId::from(id), &spec, &"alice".into())).unwrap()
    }

    #[test]
    fn decode_uses_the_row_key() {
        let row = ShapeRow {
            id: "row-id".into(),
            version: 7,
            body: body("stale-id"),
        };
        let decoded = row.decode().unwrap();
        assert_eq!(decoded.shape.id, ShapeId::from("row-id"));
        assert_eq!(decoded.version, 7);
        assert_eq!(decoded.shape.kind, ShapeKind::Ellipse);
    }

    #[test]
    fn decode_reports_malformed_bodies() {
        let row = ShapeRow {
            id: "s1".into(),
            version: 1,
            body: serde_json::json!({ "x": "not a number" }),
        };
        assert_matches!(row.decode(), Err(DbError::Malformed { id, .. }) if id == "s1");
    }

    #[test]
    fn decode_rejects_negative_versions() {
        let row = ShapeRow {
            id: "s1".into(),
            version: -1,
            body: body("s1"),
        };
        assert_matches!(
            row.decode(),
            Err(DbError::Malformed { id, reason }) if id == "s1" && reason.contains("-1")
        );
    }

    #[test]
    fn versions_outside_column_range_are_rejected() {
        assert_eq!(version_param(3).unwrap(), 3);
        assert_matches!(version_param(u64::MAX), Err(DbError::Malformed { .. }));
    }
}
