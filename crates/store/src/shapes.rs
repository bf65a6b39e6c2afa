//! The durable shape store contract.

use std::sync::Arc;

use async_trait::async_trait;
use canvas_core::collaboration::MAX_TX_ATTEMPTS;
use canvas_core::shape::{Shape, ShapePatch};
use canvas_core::types::{OwnerId, ShapeId};
use tokio::sync::watch;

use crate::error::StoreError;

/// A stored shape together with its optimistic-concurrency version.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub shape: Shape,
    pub version: u64,
}

/// What a transaction body decided after looking at the current document.
#[derive(Debug, Clone)]
pub enum Decision {
    /// Commit this document if nobody wrote in the meantime.
    Put(Shape),
    /// Leave the document untouched.
    Abort,
}

/// Outcome of [`ShapeStore::transact`].
#[derive(Debug, Clone)]
pub enum TxResult {
    /// The document that was committed.
    Committed(Shape),
    /// The body aborted; carries the document it was shown (if any) so the
    /// caller can report why.
    Aborted(Option<Shape>),
}

/// A full view of the collection, ordered by creation time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// Monotonic counter bumped on every committed write.
    pub revision: u64,
    pub shapes: Vec<Shape>,
}

/// One member of a [`ShapeStore::batch_write`].
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Persist a locally created shape; the store assigns the durable id.
    Create { temp_id: ShapeId, shape: Shape },
    Update {
        id: ShapeId,
        patch: ShapePatch,
        actor: OwnerId,
    },
    Delete { id: ShapeId },
}

impl WriteOp {
    /// The id this op refers to from the caller's point of view.
    pub fn target(&self) -> &ShapeId {
        match self {
            WriteOp::Create { temp_id, .. } => temp_id,
            WriteOp::Update { id, .. } | WriteOp::Delete { id } => id,
        }
    }
}

/// Per-member acknowledgement of a batch write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteAck {
    Created { temp_id: ShapeId, id: ShapeId },
    Updated(ShapeId),
    Deleted(ShapeId),
}

/// A persistent, queryable shape collection.
///
/// Implementations provide the versioned read and compare-and-put
/// primitives; [`transact`](ShapeStore::transact) builds the
/// optimistic-concurrency retry loop on top of them.
#[async_trait]
pub trait ShapeStore: Send + Sync {
    /// Read a document with its current version.
    async fn read_versioned(&self, id: &ShapeId) -> Result<Option<Versioned>, StoreError>;

    /// Write `next` only if the stored version still equals `expected`
    /// (`None` meaning "the document must not exist"). Returns `false` when
    /// somebody else committed first.
    async fn compare_and_put(
        &self,
        id: &ShapeId,
        expected: Option<u64>,
        next: &Shape,
    ) -> Result<bool, StoreError>;

    /// Persist a new shape under a freshly assigned durable id.
    async fn create(&self, shape: Shape) -> Result<Shape, StoreError>;

    /// Create or replace a shape under its existing id.
    async fn put(&self, shape: Shape) -> Result<(), StoreError>;

    /// Merge `patch` into an existing shape and stamp `actor` as modifier.
    async fn update(
        &self,
        id: &ShapeId,
        patch: &ShapePatch,
        actor: &OwnerId,
    ) -> Result<Shape, StoreError>;

    /// Delete a shape. Returns `false` if it did not exist.
    async fn delete(&self, id: &ShapeId) -> Result<bool, StoreError>;

    /// Delete every shape. Returns the number removed.
    async fn delete_all(&self) -> Result<u64, StoreError>;

    /// Apply many independent writes in one round trip.
    ///
    /// The outer error means the batch as a whole never reached the store;
    /// the inner results report each member separately.
    async fn batch_write(
        &self,
        ops: Vec<WriteOp>,
    ) -> Result<Vec<Result<WriteAck, StoreError>>, StoreError>;

    /// Every shape, ordered by creation time.
    async fn list(&self) -> Result<Vec<Shape>, StoreError>;

    /// Every shape whose lock is held by `owner`.
    async fn locked_by(&self, owner: &OwnerId) -> Result<Vec<Shape>, StoreError>;

    /// Live snapshot stream. Each value supersedes the previous one.
    fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>>;

    /// Run `decide` against the current document and commit its result if
    /// the document did not change in between, retrying on conflict.
    async fn transact(
        &self,
        id: &ShapeId,
        decide: &(dyn for<'a> Fn(Option<&'a Shape>) -> Decision + Send + Sync),
    ) -> Result<TxResult, StoreError> {
        for attempt in 1..=MAX_TX_ATTEMPTS {
            let current = self.read_versioned(id).await?;
            let expected = current.as_ref().map(|v| v.version);

            let next = match decide(current.as_ref().map(|v| &v.shape)) {
                Decision::Abort => return Ok(TxResult::Aborted(current.map(|v| v.shape))),
                Decision::Put(next) => next,
            };

            if self.compare_and_put(id, expected, &next).await? {
                return Ok(TxResult::Committed(next));
            }

            tracing::debug!(shape_id = %id, attempt, "Transaction conflict, retrying");
        }

        Err(StoreError::Contention {
            id: id.clone(),
            attempts: MAX_TX_ATTEMPTS,
        })
    }
}
