//! Behavioural guarantees of the collaboration layer that hold regardless
//! of interleaving.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use canvas_collab::{
    AcquireOutcome, CanvasClient, CollabConfig, CollabError, LockManager, ReleaseOutcome,
};
use canvas_core::retry::RetryPolicy;
use canvas_core::shape::{Shape, ShapeKind, ShapePatch, ShapeSpec};
use canvas_core::types::{Owner, OwnerId, ShapeId};
use canvas_store::{MemoryStore, ShapeStore};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

fn owner(id: &str) -> Owner {
    Owner::new(id, id.to_uppercase(), "#aa3300")
}

fn rect(x: f64) -> ShapeSpec {
    ShapeSpec::new(ShapeKind::Rectangle, x, 10.0, 40.0, 30.0)
}

async fn seeded(ids: &[&str]) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for id in ids {
        store
            .put(Shape::from_spec(ShapeId::from(*id), &rect(0.0), &"seed".into()))
            .await
            .unwrap();
    }
    store
}

async fn stored(store: &MemoryStore, id: &str) -> Shape {
    store.read_versioned(&id.into()).await.unwrap().unwrap().shape
}

/// Let spawned tasks and the paused clock catch up.
async fn drain() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_most_one_of_many_contenders_wins() {
    let store = seeded(&["shape-1"]).await;
    let locks = Arc::new(LockManager::new(store.clone(), RetryPolicy::default()));

    let contenders = (0..12).map(|n| {
        let locks = Arc::clone(&locks);
        tokio::spawn(async move {
            let who = owner(&format!("user-{n}"));
            locks.acquire(&"shape-1".into(), &who).await.map(|o| (who.id, o))
        })
    });
    let outcomes: Vec<_> = join_all(contenders)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let winners: Vec<&OwnerId> = outcomes
        .iter()
        .filter(|(_, outcome)| outcome.is_acquired())
        .map(|(id, _)| id)
        .collect();
    assert_eq!(winners.len(), 1);
    let winner = winners[0].clone();

    for (_, outcome) in &outcomes {
        if let AcquireOutcome::AlreadyLocked { held_by, .. } = outcome {
            assert_eq!(*held_by, winner);
        }
    }
    assert_eq!(stored(&store, "shape-1").await.locked_by, Some(winner));
}

#[tokio::test]
async fn reacquiring_an_own_lock_writes_nothing() {
    let store = seeded(&["shape-1"]).await;
    let locks = LockManager::new(store.clone(), RetryPolicy::none());
    let a = owner("a");

    assert!(locks.acquire(&"shape-1".into(), &a).await.unwrap().is_acquired());
    let version = store.read_versioned(&"shape-1".into()).await.unwrap().unwrap().version;

    assert!(locks.acquire(&"shape-1".into(), &a).await.unwrap().is_acquired());
    let after = store.read_versioned(&"shape-1".into()).await.unwrap().unwrap().version;
    assert_eq!(version, after);
}

#[tokio::test]
async fn release_clears_every_lock_field_and_commits_final_state() {
    let store = seeded(&["shape-1"]).await;
    let locks = LockManager::new(store.clone(), RetryPolicy::none());
    let a = owner("a");
    locks.acquire(&"shape-1".into(), &a).await.unwrap();

    let final_state = ShapePatch::position(75.0, 80.0);
    let outcome = locks
        .release(&"shape-1".into(), &a.id, Some(&final_state))
        .await
        .unwrap();
    assert_matches!(outcome, ReleaseOutcome::Released(_));

    let shape = stored(&store, "shape-1").await;
    assert!(!shape.is_locked);
    assert_eq!(shape.locked_by, None);
    assert_eq!(shape.locked_by_name, None);
    assert_eq!(shape.locked_by_color, None);
    assert_eq!((shape.x, shape.y), (75.0, 80.0));
    assert_eq!(shape.last_modified_by, a.id);
}

#[tokio::test]
async fn only_the_holder_may_release() {
    let store = seeded(&["shape-1"]).await;
    let locks = LockManager::new(store.clone(), RetryPolicy::none());
    locks.acquire(&"shape-1".into(), &owner("a")).await.unwrap();

    let outcome = locks.release(&"shape-1".into(), &"b".into(), None).await.unwrap();
    assert_matches!(outcome, ReleaseOutcome::NotOwner { held_by: Some(holder) } if holder == OwnerId::from("a"));
    assert!(stored(&store, "shape-1").await.is_locked_by(&"a".into()));
}

#[tokio::test]
async fn release_all_frees_every_shape_of_the_owner() {
    let store = seeded(&["s1", "s2", "s3"]).await;
    let locks = LockManager::new(store.clone(), RetryPolicy::none());
    locks.acquire(&"s1".into(), &owner("a")).await.unwrap();
    locks.acquire(&"s2".into(), &owner("a")).await.unwrap();
    locks.acquire(&"s3".into(), &owner("b")).await.unwrap();

    let summary = locks.release_all(&"a".into()).await.unwrap();
    assert!(summary.is_complete());
    let released: HashSet<_> = summary.released.into_iter().collect();
    assert_eq!(released, HashSet::from([ShapeId::from("s1"), ShapeId::from("s2")]));
    assert!(stored(&store, "s3").await.is_locked_by(&"b".into()));
}

// ---------------------------------------------------------------------------
// Client edits across two actors
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn edits_to_a_shape_locked_by_someone_else_are_refused() {
    let store = seeded(&["shape-1"]).await;
    let alice = CanvasClient::new(owner("alice"), store.clone(), CollabConfig::default()).unwrap();
    let bob = CanvasClient::new(owner("bob"), store.clone(), CollabConfig::default()).unwrap();
    let cancel = CancellationToken::new();
    let _a = alice.start_sync(cancel.clone());
    let _b = bob.start_sync(cancel.clone());
    drain().await;

    assert!(bob.lock_shape(&"shape-1".into()).await.unwrap().is_acquired());
    drain().await;

    let refused = alice.update_shape(&"shape-1".into(), &ShapePatch::position(1.0, 1.0));
    assert_matches!(refused, Err(CollabError::LockedByOther { held_by, .. }) if held_by == OwnerId::from("bob"));
    assert_matches!(
        alice.lock_shape(&"shape-1".into()).await.unwrap(),
        AcquireOutcome::AlreadyLocked { .. }
    );

    bob.unlock_shape(&"shape-1".into(), Some(&ShapePatch::position(9.0, 9.0)))
        .await
        .unwrap();
    drain().await;

    let seen = alice.state().get(&"shape-1".into()).unwrap();
    assert_eq!((seen.x, seen.y), (9.0, 9.0));
    assert!(!seen.is_locked);
    alice.update_shape(&"shape-1".into(), &ShapePatch::position(2.0, 2.0)).unwrap();
    alice.settle().await.unwrap();
    assert_eq!(stored(&store, "shape-1").await.x, 2.0);

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn creations_reach_other_clients_under_durable_ids() {
    let store = Arc::new(MemoryStore::new());
    let alice = CanvasClient::new(owner("alice"), store.clone(), CollabConfig::default()).unwrap();
    let bob = CanvasClient::new(owner("bob"), store.clone(), CollabConfig::default()).unwrap();
    let cancel = CancellationToken::new();
    let _a = alice.start_sync(cancel.clone());
    let _b = bob.start_sync(cancel.clone());

    alice.create_shapes(&[rect(1.0), rect(2.0), rect(3.0)]).unwrap();
    assert_eq!(alice.shapes().len(), 3);
    drain().await;

    let seen_by_bob: HashSet<ShapeId> = bob.shapes().iter().map(|s| s.id.clone()).collect();
    let held_by_alice: HashSet<ShapeId> = alice.shapes().iter().map(|s| s.id.clone()).collect();
    assert_eq!(seen_by_bob.len(), 3);
    assert_eq!(seen_by_bob, held_by_alice);
    assert!(seen_by_bob.iter().all(|id| !id.is_temporary()));

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn bulk_update_skips_foreign_locks() {
    let store = seeded(&["s1", "s2", "s3"]).await;
    let bob = LockManager::new(store.clone(), RetryPolicy::none());
    bob.acquire(&"s2".into(), &owner("bob")).await.unwrap();

    let alice = CanvasClient::new(owner("alice"), store.clone(), CollabConfig::default()).unwrap();
    let cancel = CancellationToken::new();
    let _sync = alice.start_sync(cancel.clone());
    drain().await;

    let report = alice
        .update_shapes(
            ["s1", "s2", "s3"]
                .into_iter()
                .map(|id| (ShapeId::from(id), ShapePatch::fill("#00ff00")))
                .collect(),
        )
        .await
        .unwrap();

    assert_eq!(report.updated.len(), 2);
    assert_eq!(report.skipped, vec![(ShapeId::from("s2"), OwnerId::from("bob"))]);
    assert!(report.failed.is_empty());

    for id in ["s1", "s3"] {
        let shape = stored(&store, id).await;
        assert_eq!(shape.fill, "#00ff00");
        assert!(!shape.is_locked);
    }
    assert_ne!(stored(&store, "s2").await.fill, "#00ff00");

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn clear_all_empties_store_state_and_history() {
    let store = seeded(&["s1", "s2"]).await;
    let client = CanvasClient::new(owner("alice"), store.clone(), CollabConfig::default()).unwrap();
    client.create_shape(&rect(5.0)).unwrap();
    client.settle().await.unwrap();
    assert!(client.can_undo());

    let removed = client.clear_all().await.unwrap();
    assert_eq!(removed, 3);
    assert!(store.list().await.unwrap().is_empty());
    assert!(client.shapes().is_empty());
    assert!(!client.can_undo());
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn undo_restores_every_field_the_update_touched() {
    let store = Arc::new(MemoryStore::new());
    let client = CanvasClient::new(owner("alice"), store.clone(), CollabConfig::default()).unwrap();
    client.create_shape(&rect(0.0).with_fill("#111111").with_text("hello")).unwrap();
    let id = client.flush().await.unwrap().created[0].1.clone();
    let before = client.state().get(&id).unwrap();

    let edit = ShapePatch {
        x: Some(300.0),
        width: Some(90.0),
        fill: Some("#ff0000".into()),
        text: Some(Some("changed".into())),
        rotation: Some(45.0),
        ..ShapePatch::default()
    };
    client.update_shape(&id, &edit).unwrap();
    client.settle().await.unwrap();
    assert_eq!(stored(&store, id.as_str()).await.fill, "#ff0000");

    assert!(client.undo().await.unwrap());
    let local = client.state().get(&id).unwrap();
    let durable = stored(&store, id.as_str()).await;
    for shape in [&local, &durable] {
        assert_eq!(shape.x, before.x);
        assert_eq!(shape.width, before.width);
        assert_eq!(shape.fill, before.fill);
        assert_eq!(shape.text, before.text);
        assert_eq!(shape.rotation, before.rotation);
    }
}

#[tokio::test(start_paused = true)]
async fn undoing_a_batch_of_creations_restores_the_prior_size() {
    let store = seeded(&["keep-1", "keep-2"]).await;
    let client = CanvasClient::new(owner("alice"), store.clone(), CollabConfig::default()).unwrap();
    let cancel = CancellationToken::new();
    let _sync = client.start_sync(cancel.clone());
    drain().await;
    let prior = client.shapes().len();
    assert_eq!(prior, 2);

    const N: usize = 20;
    let specs: Vec<_> = (0..N).map(|n| rect(n as f64 * 10.0)).collect();
    client.create_shapes(&specs).unwrap();
    client.settle().await.unwrap();
    drain().await;
    assert_eq!(client.shapes().len(), prior + N);
    assert_eq!(store.stats().batch_writes, 1);

    for _ in 0..N {
        assert!(client.undo().await.unwrap());
    }
    drain().await;

    assert_eq!(client.shapes().len(), prior);
    assert_eq!(store.list().await.unwrap().len(), prior);
    assert!(!client.can_undo());
    assert!(client.redo().await.unwrap());

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn undo_before_the_batch_lands_still_removes_the_shape() {
    let store = Arc::new(MemoryStore::new());
    let client = CanvasClient::new(owner("alice"), store.clone(), CollabConfig::default()).unwrap();

    let temp = client.create_shape(&rect(0.0)).unwrap();
    assert!(client.undo().await.unwrap());
    assert!(!client.state().contains(&temp));

    let report = client.flush().await.unwrap();
    assert!(report.created.is_empty());
    assert_eq!(report.skipped, 1);
    assert!(store.list().await.unwrap().is_empty());

    // Redo requeues the shape; it lands under a durable id.
    assert!(client.redo().await.unwrap());
    client.settle().await.unwrap();
    let shapes = client.shapes();
    assert_eq!(shapes.len(), 1);
    assert!(!shapes[0].id.is_temporary());
    assert_eq!(store.list().await.unwrap().len(), 1);
}
