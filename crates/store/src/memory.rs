//! In-process [`ShapeStore`] backed by a `tokio::sync::RwLock`.
//!
//! Every committed write bumps the document version and publishes a fresh
//! [`Snapshot`] on a `watch` channel. The store also supports fault
//! injection so callers' retry and rollback paths can be exercised.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use canvas_core::shape::{Shape, ShapePatch};
use canvas_core::types::{OwnerId, ShapeId};
use tokio::sync::{watch, RwLock};

use crate::error::StoreError;
use crate::shapes::{ShapeStore, Snapshot, Versioned, WriteAck, WriteOp};

type RejectFn = Box<dyn Fn(&WriteOp) -> Option<StoreError> + Send + Sync>;

/// Counters describing how the store has been called.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of `batch_write` calls that reached the store.
    pub batch_writes: u64,
    /// Total members across all batch writes.
    pub batch_ops: u64,
    /// Number of single-document writes (including transaction commits).
    pub single_writes: u64,
}

struct Doc {
    shape: Shape,
    version: u64,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    docs: HashMap<ShapeId, Doc>,
    next_seq: u64,
    revision: u64,
}

impl Inner {
    fn snapshot(&self) -> Snapshot {
        let mut docs: Vec<&Doc> = self.docs.values().collect();
        docs.sort_by(|a, b| {
            a.shape
                .created_at
                .cmp(&b.shape.created_at)
                .then(a.seq.cmp(&b.seq))
        });
        Snapshot {
            revision: self.revision,
            shapes: docs.into_iter().map(|d| d.shape.clone()).collect(),
        }
    }

    /// Insert or replace a document, keeping its creation sequence when it
    /// already exists.
    fn upsert(&mut self, shape: Shape) {
        match self.docs.get_mut(&shape.id) {
            Some(doc) => {
                doc.shape = shape;
                doc.version += 1;
            }
            None => {
                self.next_seq += 1;
                let seq = self.next_seq;
                self.docs.insert(
                    shape.id.clone(),
                    Doc {
                        shape,
                        version: 1,
                        seq,
                    },
                );
            }
        }
    }

    fn apply_patch(
        &mut self,
        id: &ShapeId,
        patch: &ShapePatch,
        actor: &OwnerId,
    ) -> Result<Shape, StoreError> {
        let doc = self
            .docs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        patch.apply_to(&mut doc.shape);
        doc.shape.touch(actor);
        doc.version += 1;
        Ok(doc.shape.clone())
    }

    fn create(&mut self, mut shape: Shape) -> Shape {
        shape.id = ShapeId::durable();
        self.upsert(shape.clone());
        shape
    }
}

/// Shape store held entirely in memory.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    snapshots: watch::Sender<Arc<Snapshot>>,
    faults: Mutex<VecDeque<StoreError>>,
    reject: Mutex<Option<RejectFn>>,
    batch_writes: AtomicU64,
    batch_ops: AtomicU64,
    single_writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (snapshots, _) = watch::channel(Arc::new(Snapshot::default()));
        Self {
            inner: RwLock::new(Inner::default()),
            snapshots,
            faults: Mutex::new(VecDeque::new()),
            reject: Mutex::new(None),
            batch_writes: AtomicU64::new(0),
            batch_ops: AtomicU64::new(0),
            single_writes: AtomicU64::new(0),
        }
    }

    /// Queue an error returned by the next store operation instead of
    /// running it. Faults are consumed in FIFO order.
    pub fn inject_fault(&self, error: StoreError) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.push_back(error);
        }
    }

    /// Reject individual batch members for which `rule` returns an error.
    pub fn reject_batch_members_where(
        &self,
        rule: impl Fn(&WriteOp) -> Option<StoreError> + Send + Sync + 'static,
    ) {
        if let Ok(mut reject) = self.reject.lock() {
            *reject = Some(Box::new(rule));
        }
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            batch_writes: self.batch_writes.load(Ordering::Relaxed),
            batch_ops: self.batch_ops.load(Ordering::Relaxed),
            single_writes: self.single_writes.load(Ordering::Relaxed),
        }
    }

    fn take_fault(&self) -> Result<(), StoreError> {
        let fault = self.faults.lock().ok().and_then(|mut f| f.pop_front());
        match fault {
            Some(err) => {
                tracing::debug!(error = %err, "Injected store fault");
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn rejection(&self, op: &WriteOp) -> Option<StoreError> {
        self.reject
            .lock()
            .ok()
            .and_then(|rule| rule.as_ref().and_then(|r| r(op)))
    }

    fn publish(&self, inner: &mut Inner) {
        inner.revision += 1;
        self.snapshots.send_replace(Arc::new(inner.snapshot()));
    }

    fn count_single_write(&self) {
        self.single_writes.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShapeStore for MemoryStore {
    async fn read_versioned(&self, id: &ShapeId) -> Result<Option<Versioned>, StoreError> {
        self.take_fault()?;
        let inner = self.inner.read().await;
        Ok(inner.docs.get(id).map(|doc| Versioned {
            shape: doc.shape.clone(),
            version: doc.version,
        }))
    }

    async fn compare_and_put(
        &self,
        id: &ShapeId,
        expected: Option<u64>,
        next: &Shape,
    ) -> Result<bool, StoreError> {
        self.take_fault()?;
        if &next.id != id {
            return Err(StoreError::InvalidArgument(format!(
                "document id {} does not match key {id}",
                next.id
            )));
        }
        let mut inner = self.inner.write().await;
        let current = inner.docs.get(id).map(|doc| doc.version);
        if current != expected {
            return Ok(false);
        }
        inner.upsert(next.clone());
        self.count_single_write();
        self.publish(&mut inner);
        Ok(true)
    }

    async fn create(&self, shape: Shape) -> Result<Shape, StoreError> {
        self.take_fault()?;
        let mut inner = self.inner.write().await;
        let created = inner.create(shape);
        self.count_single_write();
        self.publish(&mut inner);
        Ok(created)
    }

    async fn put(&self, shape: Shape) -> Result<(), StoreError> {
        self.take_fault()?;
        if shape.id.is_temporary() {
            return Err(StoreError::InvalidArgument(format!(
                "cannot persist temporary id {}",
                shape.id
            )));
        }
        let mut inner = self.inner.write().await;
        inner.upsert(shape);
        self.count_single_write();
        self.publish(&mut inner);
        Ok(())
    }

    async fn update(
        &self,
        id: &ShapeId,
        patch: &ShapePatch,
        actor: &OwnerId,
    ) -> Result<Shape, StoreError> {
        self.take_fault()?;
        let mut inner = self.inner.write().await;
        let updated = inner.apply_patch(id, patch, actor)?;
        self.count_single_write();
        self.publish(&mut inner);
        Ok(updated)
    }

    async fn delete(&self, id: &ShapeId) -> Result<bool, StoreError> {
        self.take_fault()?;
        let mut inner = self.inner.write().await;
        let existed = inner.docs.remove(id).is_some();
        if existed {
            self.count_single_write();
            self.publish(&mut inner);
        }
        Ok(existed)
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        self.take_fault()?;
        let mut inner = self.inner.write().await;
        let removed = inner.docs.len() as u64;
        inner.docs.clear();
        self.publish(&mut inner);
        Ok(removed)
    }

    async fn batch_write(
        &self,
        ops: Vec<WriteOp>,
    ) -> Result<Vec<Result<WriteAck, StoreError>>, StoreError> {
        self.take_fault()?;
        self.batch_writes.fetch_add(1, Ordering::Relaxed);
        self.batch_ops.fetch_add(ops.len() as u64, Ordering::Relaxed);

        let mut inner = self.inner.write().await;
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            if let Some(err) = self.rejection(&op) {
                results.push(Err(err));
                continue;
            }
            let result = match op {
                WriteOp::Create { temp_id, shape } => {
                    let created = inner.create(shape);
                    Ok(WriteAck::Created {
                        temp_id,
                        id: created.id,
                    })
                }
                WriteOp::Update { id, patch, actor } => inner
                    .apply_patch(&id, &patch, &actor)
                    .map(|_| WriteAck::Updated(id)),
                WriteOp::Delete { id } => {
                    inner.docs.remove(&id);
                    Ok(WriteAck::Deleted(id))
                }
            };
            results.push(result);
        }
        self.publish(&mut inner);
        Ok(results)
    }

    async fn list(&self) -> Result<Vec<Shape>, StoreError> {
        self.take_fault()?;
        Ok(self.inner.read().await.snapshot().shapes)
    }

    async fn locked_by(&self, owner: &OwnerId) -> Result<Vec<Shape>, StoreError> {
        self.take_fault()?;
        let inner = self.inner.read().await;
        Ok(inner
            .snapshot()
            .shapes
            .into_iter()
            .filter(|s| s.is_locked_by(owner))
            .collect())
    }

    fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshots.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use canvas_core::shape::{ShapeKind, ShapeSpec};

    use super::*;
    use crate::shapes::{Decision, TxResult};

    fn shape(id: &str) -> Shape {
        let spec = ShapeSpec::new(ShapeKind::Rectangle, 0.0, 0.0, 10.0, 10.0);
        Shape::from_spec(ShapeId::from(id), &spec, &OwnerId::from("alice"))
    }

    #[tokio::test]
    async fn create_assigns_durable_id() {
        let store = MemoryStore::new();
        let created = store.create(shape("tmp-1")).await.unwrap();
        assert!(!created.id.is_temporary());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn compare_and_put_rejects_stale_version() {
        let store = MemoryStore::new();
        store.put(shape("s1")).await.unwrap();
        let v = store.read_versioned(&"s1".into()).await.unwrap().unwrap();

        let mut next = v.shape.clone();
        next.x = 5.0;
        assert!(store
            .compare_and_put(&"s1".into(), Some(v.version), &next)
            .await
            .unwrap());
        // The same expected version is now stale.
        assert!(!store
            .compare_and_put(&"s1".into(), Some(v.version), &next)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn compare_and_put_with_none_requires_absence() {
        let store = MemoryStore::new();
        assert!(store.compare_and_put(&"s1".into(), None, &shape("s1")).await.unwrap());
        assert!(!store.compare_and_put(&"s1".into(), None, &shape("s1")).await.unwrap());
    }

    #[tokio::test]
    async fn transact_aborts_without_writing() {
        let store = MemoryStore::new();
        store.put(shape("s1")).await.unwrap();
        let before = store.stats().single_writes;

        let result = store.transact(&"s1".into(), &|_| Decision::Abort).await.unwrap();
        assert_matches!(result, TxResult::Aborted(Some(s)) if s.id == ShapeId::from("s1"));
        assert_eq!(store.stats().single_writes, before);
    }

    #[tokio::test]
    async fn transact_reports_contention_after_bounded_attempts() {
        let store = Arc::new(MemoryStore::new());
        store.put(shape("s1")).await.unwrap();

        // Every attempt loses the race against a concurrent writer.
        let racer = Arc::clone(&store);
        let decide = move |current: Option<&Shape>| {
            let mut next = current.cloned().unwrap();
            next.x += 1.0;
            let racer = Arc::clone(&racer);
            let id = next.id.clone();
            std::thread::spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
                rt.block_on(racer.update(&id, &ShapePatch::fill("#000000"), &"bob".into()))
                    .unwrap();
            })
            .join()
            .unwrap();
            Decision::Put(next)
        };

        let result = store.transact(&"s1".into(), &decide).await;
        assert_matches!(result, Err(StoreError::Contention { attempts, .. }) if attempts == 5);
    }

    #[tokio::test]
    async fn update_missing_shape_is_not_found() {
        let store = MemoryStore::new();
        let result = store
            .update(&"nope".into(), &ShapePatch::position(1.0, 1.0), &"a".into())
            .await;
        assert_matches!(result, Err(StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_stamps_modifier() {
        let store = MemoryStore::new();
        store.put(shape("s1")).await.unwrap();
        let updated = store
            .update(&"s1".into(), &ShapePatch::position(3.0, 4.0), &"bob".into())
            .await
            .unwrap();
        assert_eq!(updated.last_modified_by, OwnerId::from("bob"));
        assert_eq!((updated.x, updated.y), (3.0, 4.0));
    }

    #[tokio::test]
    async fn put_rejects_temporary_ids() {
        let store = MemoryStore::new();
        let result = store.put(shape("tmp-abc")).await;
        assert_matches!(result, Err(StoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_in_order() {
        let store = MemoryStore::new();
        store.inject_fault(StoreError::Unavailable("down".into()));
        assert_matches!(store.list().await, Err(StoreError::Unavailable(_)));
        assert!(store.list().await.is_ok());
    }

    #[tokio::test]
    async fn batch_write_reports_members_individually() {
        let store = MemoryStore::new();
        store.reject_batch_members_where(|op| match op {
            WriteOp::Create { shape, .. } if shape.fill == "#bad000" => {
                Some(StoreError::InvalidArgument("rejected".into()))
            }
            _ => None,
        });

        let good = shape("tmp-good");
        let mut bad = shape("tmp-bad");
        bad.fill = "#bad000".into();

        let results = store
            .batch_write(vec![
                WriteOp::Create {
                    temp_id: "tmp-good".into(),
                    shape: good,
                },
                WriteOp::Create {
                    temp_id: "tmp-bad".into(),
                    shape: bad,
                },
            ])
            .await
            .unwrap();

        assert_matches!(&results[0], Ok(WriteAck::Created { temp_id, .. }) if temp_id.as_str() == "tmp-good");
        assert_matches!(&results[1], Err(StoreError::InvalidArgument(_)));
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert_eq!(store.stats().batch_writes, 1);
        assert_eq!(store.stats().batch_ops, 2);
    }

    #[tokio::test]
    async fn snapshots_follow_writes_and_keep_creation_order() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();

        store.put(shape("a")).await.unwrap();
        store.put(shape("b")).await.unwrap();
        store
            .update(&"a".into(), &ShapePatch::position(9.0, 9.0), &"alice".into())
            .await
            .unwrap();

        rx.changed().await.unwrap();
        let snapshot = rx.borrow_and_update().clone();
        let ids: Vec<&str> = snapshot.shapes.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(snapshot.revision, 3);
    }

    #[tokio::test]
    async fn locked_by_filters_on_holder() {
        let store = MemoryStore::new();
        let mut locked = shape("a");
        locked.is_locked = true;
        locked.locked_by = Some("alice".into());
        store.put(locked).await.unwrap();
        store.put(shape("b")).await.unwrap();

        let held = store.locked_by(&"alice".into()).await.unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].id, ShapeId::from("a"));
        assert!(store.locked_by(&"bob".into()).await.unwrap().is_empty());
    }
}
