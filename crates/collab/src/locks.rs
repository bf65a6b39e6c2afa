//! Advisory per-shape edit locks.
//!
//! Acquire and release run as optimistic transactions against the shape
//! document itself, so two concurrent acquirers can never both win. A lost
//! race is a typed outcome rather than an error.

use std::sync::Arc;

use canvas_core::retry::{retry, RetryPolicy};
use canvas_core::shape::{Shape, ShapePatch};
use canvas_core::types::{Owner, OwnerId, ShapeId};
use canvas_events::{CanvasEvent, EventBus};
use canvas_store::{Decision, ShapeStore, StoreError, TxResult};
use futures::future::join_all;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of [`LockManager::acquire`].
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireOutcome {
    /// The caller holds the lock. Re-acquiring an own lock lands here too.
    Acquired(Shape),
    /// Somebody else holds the lock.
    AlreadyLocked {
        held_by: OwnerId,
        holder_name: Option<String>,
    },
    /// The shape does not exist.
    Missing,
}

impl AcquireOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, AcquireOutcome::Acquired(_))
    }
}

/// Result of [`LockManager::release`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReleaseOutcome {
    Released(Shape),
    /// The caller does not hold the lock; `held_by` names the actual
    /// holder, if any.
    NotOwner { held_by: Option<OwnerId> },
    Missing,
}

/// What [`LockManager::release_all`] managed to do.
#[derive(Debug, Default)]
pub struct ReleaseSummary {
    pub released: Vec<ShapeId>,
    pub failed: Vec<(ShapeId, StoreError)>,
}

impl ReleaseSummary {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

// ---------------------------------------------------------------------------
// LockManager
// ---------------------------------------------------------------------------

/// Grants and revokes per-shape edit locks.
pub struct LockManager {
    store: Arc<dyn ShapeStore>,
    retry: RetryPolicy,
    events: Option<Arc<EventBus>>,
}

impl LockManager {
    pub fn new(store: Arc<dyn ShapeStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Take the lock on `shape_id` for `owner` if nobody else holds it.
    pub async fn acquire(
        &self,
        shape_id: &ShapeId,
        owner: &Owner,
    ) -> Result<AcquireOutcome, StoreError> {
        let decide = |current: Option<&Shape>| match current {
            Some(shape) if shape.held_by_other(&owner.id).is_none()
                && !shape.is_locked_by(&owner.id) =>
            {
                let mut next = shape.clone();
                ShapePatch::lock(owner).apply_to(&mut next);
                next.touch(&owner.id);
                Decision::Put(next)
            }
            _ => Decision::Abort,
        };

        let store = &self.store;
        let decide = &decide;
        let result = retry(&self.retry, "lock.acquire", move || {
            store.transact(shape_id, decide)
        })
        .await?;

        let outcome = match result {
            TxResult::Committed(shape) => AcquireOutcome::Acquired(shape),
            TxResult::Aborted(None) => AcquireOutcome::Missing,
            TxResult::Aborted(Some(shape)) => match shape.held_by_other(&owner.id) {
                Some(holder) => AcquireOutcome::AlreadyLocked {
                    held_by: holder.clone(),
                    holder_name: shape.locked_by_name.clone(),
                },
                // Already ours; nothing to write.
                None => AcquireOutcome::Acquired(shape),
            },
        };

        match &outcome {
            AcquireOutcome::Acquired(_) => {
                tracing::debug!(shape_id = %shape_id, owner = %owner.id, "Lock acquired");
                self.publish(CanvasEvent::LockAcquired {
                    shape_id: shape_id.clone(),
                    owner: owner.id.clone(),
                });
            }
            AcquireOutcome::AlreadyLocked { held_by, .. } => {
                tracing::debug!(
                    shape_id = %shape_id,
                    owner = %owner.id,
                    held_by = %held_by,
                    "Lock denied",
                );
                self.publish(CanvasEvent::LockDenied {
                    shape_id: shape_id.clone(),
                    owner: owner.id.clone(),
                    held_by: held_by.clone(),
                });
            }
            AcquireOutcome::Missing => {
                tracing::debug!(shape_id = %shape_id, "Lock requested on missing shape");
            }
        }
        Ok(outcome)
    }

    /// Clear the lock on `shape_id` if `owner` holds it.
    ///
    /// `final_state` is folded into the same transaction so the last edit
    /// and the unlock commit together. Lock fields inside it are ignored.
    pub async fn release(
        &self,
        shape_id: &ShapeId,
        owner: &OwnerId,
        final_state: Option<&ShapePatch>,
    ) -> Result<ReleaseOutcome, StoreError> {
        let final_state = final_state.map(ShapePatch::without_lock_fields);
        let decide = |current: Option<&Shape>| match current {
            Some(shape) if shape.is_locked_by(owner) => {
                let mut next = shape.clone();
                if let Some(patch) = &final_state {
                    patch.apply_to(&mut next);
                }
                ShapePatch::unlock().apply_to(&mut next);
                next.touch(owner);
                Decision::Put(next)
            }
            _ => Decision::Abort,
        };

        let store = &self.store;
        let decide = &decide;
        let result = retry(&self.retry, "lock.release", move || {
            store.transact(shape_id, decide)
        })
        .await?;

        let outcome = match result {
            TxResult::Committed(shape) => ReleaseOutcome::Released(shape),
            TxResult::Aborted(None) => ReleaseOutcome::Missing,
            TxResult::Aborted(Some(shape)) => ReleaseOutcome::NotOwner {
                held_by: shape.held_by_other(owner).cloned(),
            },
        };

        if let ReleaseOutcome::Released(_) = &outcome {
            tracing::debug!(shape_id = %shape_id, owner = %owner, "Lock released");
            self.publish(CanvasEvent::LockReleased {
                shape_id: shape_id.clone(),
                owner: owner.clone(),
            });
        }
        Ok(outcome)
    }

    /// Release every lock `owner` holds. Failures are collected per shape;
    /// the outer error means the holder query itself failed.
    pub async fn release_all(&self, owner: &OwnerId) -> Result<ReleaseSummary, StoreError> {
        let store = &self.store;
        let held = retry(&self.retry, "lock.list_held", move || store.locked_by(owner)).await?;

        let results = join_all(
            held.iter()
                .map(|shape| async move { (shape.id.clone(), self.release(&shape.id, owner, None).await) }),
        )
        .await;

        let mut summary = ReleaseSummary::default();
        for (shape_id, result) in results {
            match result {
                Ok(ReleaseOutcome::Released(_)) => summary.released.push(shape_id),
                // Someone else already cleared or retook it.
                Ok(ReleaseOutcome::NotOwner { .. } | ReleaseOutcome::Missing) => {}
                Err(e) => {
                    tracing::warn!(shape_id = %shape_id, owner = %owner, error = %e, "Failed to release lock");
                    summary.failed.push((shape_id, e));
                }
            }
        }
        Ok(summary)
    }

    fn publish(&self, event: CanvasEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use canvas_core::shape::{ShapeKind, ShapeSpec};
    use canvas_store::MemoryStore;

    use super::*;

    fn owner(id: &str) -> Owner {
        Owner::new(id, id.to_uppercase(), "#112233")
    }

    async fn seeded() -> (Arc<MemoryStore>, LockManager) {
        let store = Arc::new(MemoryStore::new());
        let spec = ShapeSpec::new(ShapeKind::Rectangle, 0.0, 0.0, 10.0, 10.0);
        store
            .put(Shape::from_spec("s1".into(), &spec, &"seed".into()))
            .await
            .unwrap();
        let locks = LockManager::new(store.clone(), RetryPolicy::none());
        (store, locks)
    }

    #[tokio::test]
    async fn acquire_free_shape() {
        let (_, locks) = seeded().await;
        let outcome = locks.acquire(&"s1".into(), &owner("alice")).await.unwrap();
        assert_matches!(outcome, AcquireOutcome::Acquired(shape) => {
            assert!(shape.is_locked_by(&"alice".into()));
            assert_eq!(shape.locked_by_name.as_deref(), Some("ALICE"));
            assert_eq!(shape.locked_by_color.as_deref(), Some("#112233"));
        });
    }

    #[tokio::test]
    async fn acquire_held_shape_reports_holder() {
        let (_, locks) = seeded().await;
        locks.acquire(&"s1".into(), &owner("alice")).await.unwrap();
        let outcome = locks.acquire(&"s1".into(), &owner("bob")).await.unwrap();
        assert_eq!(
            outcome,
            AcquireOutcome::AlreadyLocked {
                held_by: "alice".into(),
                holder_name: Some("ALICE".into()),
            }
        );
    }

    #[tokio::test]
    async fn reacquire_is_idempotent_and_skips_the_write() {
        let (store, locks) = seeded().await;
        locks.acquire(&"s1".into(), &owner("alice")).await.unwrap();
        let writes = store.stats().single_writes;
        let outcome = locks.acquire(&"s1".into(), &owner("alice")).await.unwrap();
        assert!(outcome.is_acquired());
        assert_eq!(store.stats().single_writes, writes);
    }

    #[tokio::test]
    async fn acquire_missing_shape() {
        let (_, locks) = seeded().await;
        let outcome = locks.acquire(&"nope".into(), &owner("alice")).await.unwrap();
        assert_eq!(outcome, AcquireOutcome::Missing);
    }

    #[tokio::test]
    async fn release_by_non_holder_changes_nothing() {
        let (store, locks) = seeded().await;
        locks.acquire(&"s1".into(), &owner("alice")).await.unwrap();
        let outcome = locks.release(&"s1".into(), &"bob".into(), None).await.unwrap();
        assert_eq!(
            outcome,
            ReleaseOutcome::NotOwner {
                held_by: Some("alice".into())
            }
        );
        let stored = store.list().await.unwrap();
        assert!(stored[0].is_locked_by(&"alice".into()));
    }

    #[tokio::test]
    async fn release_folds_final_state_and_ignores_lock_fields() {
        let (store, locks) = seeded().await;
        locks.acquire(&"s1".into(), &owner("alice")).await.unwrap();

        let mut final_state = ShapePatch::position(40.0, 50.0);
        final_state.merge(&ShapePatch::lock(&owner("mallory")));
        let outcome = locks
            .release(&"s1".into(), &"alice".into(), Some(&final_state))
            .await
            .unwrap();
        assert_matches!(outcome, ReleaseOutcome::Released(_));

        let stored = &store.list().await.unwrap()[0];
        assert_eq!((stored.x, stored.y), (40.0, 50.0));
        assert!(!stored.is_locked);
        assert_eq!(stored.locked_by, None);
        assert_eq!(stored.locked_by_name, None);
        assert_eq!(stored.last_modified_by, OwnerId::from("alice"));
    }

    #[tokio::test]
    async fn release_all_clears_only_the_owners_locks() {
        let store = Arc::new(MemoryStore::new());
        let spec = ShapeSpec::new(ShapeKind::Line, 0.0, 0.0, 1.0, 1.0);
        for id in ["a", "b", "c"] {
            store
                .put(Shape::from_spec(id.into(), &spec, &"seed".into()))
                .await
                .unwrap();
        }
        let locks = LockManager::new(store.clone(), RetryPolicy::none());
        locks.acquire(&"a".into(), &owner("alice")).await.unwrap();
        locks.acquire(&"b".into(), &owner("alice")).await.unwrap();
        locks.acquire(&"c".into(), &owner("bob")).await.unwrap();

        let summary = locks.release_all(&"alice".into()).await.unwrap();
        assert!(summary.is_complete());
        let mut released = summary.released.clone();
        released.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(released, vec![ShapeId::from("a"), ShapeId::from("b")]);

        assert!(store.locked_by(&"alice".into()).await.unwrap().is_empty());
        assert_eq!(store.locked_by(&"bob".into()).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let (store, _) = seeded().await;
        let locks = LockManager::new(store.clone(), RetryPolicy::default());
        store.inject_fault(StoreError::Unavailable("blip".into()));
        let outcome = locks.acquire(&"s1".into(), &owner("alice")).await.unwrap();
        assert!(outcome.is_acquired());
    }

    #[tokio::test]
    async fn permission_errors_are_not_retried() {
        let (store, _) = seeded().await;
        let locks = LockManager::new(store.clone(), RetryPolicy::default());
        store.inject_fault(StoreError::PermissionDenied("rules".into()));
        let err = locks.acquire(&"s1".into(), &owner("alice")).await.unwrap_err();
        assert_matches!(err, StoreError::PermissionDenied(_));
    }

    #[tokio::test]
    async fn outcomes_are_published() {
        let (store, _) = seeded().await;
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let locks = LockManager::new(store, RetryPolicy::none()).with_events(bus);

        locks.acquire(&"s1".into(), &owner("alice")).await.unwrap();
        locks.acquire(&"s1".into(), &owner("bob")).await.unwrap();

        assert_matches!(rx.recv().await.unwrap().event, CanvasEvent::LockAcquired { .. });
        assert_matches!(
            rx.recv().await.unwrap().event,
            CanvasEvent::LockDenied { held_by, .. } if held_by == OwnerId::from("alice")
        );
    }
}
