//! Concurrency tests for the optimistic-concurrency transaction loop.
//!
//! Many tasks race a "claim if unclaimed" transaction against the same
//! document on a multi-threaded runtime; exactly one must commit.

use std::sync::Arc;

use canvas_core::shape::{Shape, ShapeKind, ShapeSpec};
use canvas_core::types::{OwnerId, ShapeId};
use canvas_store::{Decision, MemoryStore, ShapeStore, TxResult};

fn unclaimed(id: &str) -> Shape {
    let spec = ShapeSpec::new(ShapeKind::Ellipse, 0.0, 0.0, 5.0, 5.0);
    Shape::from_spec(ShapeId::from(id), &spec, &OwnerId::from("seed"))
}

// ---------------------------------------------------------------------------
// Test: concurrent claims resolve to exactly one winner
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_have_single_winner() {
    let store = Arc::new(MemoryStore::new());
    store.put(unclaimed("shape-1")).await.unwrap();

    let mut handles = Vec::new();
    for n in 0..16 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let me = OwnerId::from(format!("client-{n}"));
            let decide = |current: Option<&Shape>| match current {
                Some(shape) if !shape.is_locked => {
                    let mut next = shape.clone();
                    next.is_locked = true;
                    next.locked_by = Some(me.clone());
                    Decision::Put(next)
                }
                _ => Decision::Abort,
            };
            store.transact(&ShapeId::from("shape-1"), &decide).await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        // Contention errors count as losses.
        if let Ok(Ok(TxResult::Committed(_))) = handle.await {
            winners += 1;
        }
    }

    assert_eq!(winners, 1);
    let stored = store.list().await.unwrap();
    assert!(stored[0].is_locked);
    assert!(stored[0].locked_by.is_some());
}

// ---------------------------------------------------------------------------
// Test: a transaction on a missing document sees `None`
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transact_on_missing_document_sees_none() {
    let store = MemoryStore::new();
    let result = store
        .transact(&ShapeId::from("ghost"), &|current| {
            assert!(current.is_none());
            Decision::Abort
        })
        .await
        .unwrap();
    assert!(matches!(result, TxResult::Aborted(None)));
}
