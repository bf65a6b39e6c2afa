//! Client-side mirror of the shared shape collection.
//!
//! Local edits land here synchronously and are recorded in a short-lived
//! overlay. When a store snapshot arrives, overlay entries belonging to the
//! local actor's own lock session are layered back on top so an
//! out-of-order echo of an earlier write cannot make the view snap back.
//! Everything the overlay holds expires after its TTL, so the view always
//! converges to durable truth.
//!
//! Besides edits the container tracks two kinds of local-only facts:
//!
//! - **pending inserts**: shapes created or restored locally that the store
//!   has not echoed yet. Temporary ids stay until swapped or removed;
//!   durable ids stay for one TTL.
//! - **tombstones**: durable shapes removed locally whose deletion the store
//!   has not echoed yet. A tombstone expires after one TTL.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use canvas_core::shape::{Shape, ShapePatch};
use canvas_core::types::{OwnerId, ShapeId};
use canvas_store::Snapshot;
use tokio::sync::watch;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Overlay entries
// ---------------------------------------------------------------------------

/// A local edit that has not been confirmed by a snapshot yet.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticEntry {
    /// Every field written locally since the entry was opened.
    pub patch: ShapePatch,
    /// Time of the latest local write folded into `patch`.
    pub applied_at: Instant,
    /// The local actor held the lock before or after one of the writes.
    pub shielded: bool,
}

impl OptimisticEntry {
    fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.applied_at) < ttl
    }
}

/// What [`CanvasState::ingest_snapshot`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Shapes in the merged view.
    pub shapes: usize,
    /// Overlay entries layered on top of the snapshot.
    pub layered: usize,
    /// Overlay entries the snapshot already reflects.
    pub confirmed: usize,
    /// Overlay entries discarded because the snapshot wins.
    pub overridden: usize,
    /// Snapshot shapes hidden by a local deletion.
    pub suppressed: usize,
    /// Local-only shapes carried over.
    pub pending: usize,
    /// Entries, tombstones and pending inserts that aged out.
    pub expired: usize,
}

// ---------------------------------------------------------------------------
// CanvasState
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Inner {
    shapes: Vec<Shape>,
    overlay: HashMap<ShapeId, OptimisticEntry>,
    tombstones: HashMap<ShapeId, Instant>,
    pending: HashMap<ShapeId, Instant>,
}

impl Inner {
    fn position(&self, id: &ShapeId) -> Option<usize> {
        self.shapes.iter().position(|s| &s.id == id)
    }

    fn prune(&mut self, now: Instant, ttl: Duration) -> usize {
        let before = self.overlay.len() + self.tombstones.len() + self.pending.len();
        self.overlay.retain(|_, entry| entry.is_fresh(now, ttl));
        self.tombstones
            .retain(|_, at| now.saturating_duration_since(*at) < ttl);
        self.pending.retain(|id, at| {
            id.is_temporary() || now.saturating_duration_since(*at) < ttl
        });
        before - (self.overlay.len() + self.tombstones.len() + self.pending.len())
    }
}

/// The local actor's view of the canvas.
///
/// All methods are synchronous; the view is published on a `watch` channel
/// after every change.
pub struct CanvasState {
    actor: OwnerId,
    ttl: Duration,
    inner: Mutex<Inner>,
    view: watch::Sender<Arc<Vec<Shape>>>,
}

impl CanvasState {
    pub fn new(actor: OwnerId, ttl: Duration) -> Self {
        let (view, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            actor,
            ttl,
            inner: Mutex::new(Inner::default()),
            view,
        }
    }

    pub fn actor(&self) -> &OwnerId {
        &self.actor
    }

    /// The current view, in snapshot order followed by local-only shapes.
    pub fn shapes(&self) -> Arc<Vec<Shape>> {
        Arc::clone(&self.view.borrow())
    }

    pub fn get(&self, id: &ShapeId) -> Option<Shape> {
        self.view.borrow().iter().find(|s| &s.id == id).cloned()
    }

    pub fn contains(&self, id: &ShapeId) -> bool {
        self.view.borrow().iter().any(|s| &s.id == id)
    }

    /// Durable shapes structurally equal to `shape`.
    pub fn find_same_content(&self, shape: &Shape) -> Option<Shape> {
        self.view
            .borrow()
            .iter()
            .find(|s| !s.id.is_temporary() && s.same_content(shape))
            .cloned()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<Shape>>> {
        self.view.subscribe()
    }

    pub fn overlay_entry(&self, id: &ShapeId) -> Option<OptimisticEntry> {
        self.lock().overlay.get(id).cloned()
    }

    pub fn overlay_len(&self) -> usize {
        self.lock().overlay.len()
    }

    /// Apply `patch` to the local shape immediately and open or extend its
    /// overlay entry. Returns the shape as it was before the write, or
    /// `None` if the shape is not in the view.
    pub fn apply_local(&self, id: &ShapeId, patch: &ShapePatch) -> Option<Shape> {
        let now = Instant::now();
        self.mutate(|inner| {
            let index = inner.position(id)?;
            let shape = &mut inner.shapes[index];
            let before = shape.clone();
            patch.apply_to(shape);
            shape.touch(&self.actor);
            let shielded = before.is_locked_by(&self.actor) || shape.is_locked_by(&self.actor);

            inner
                .overlay
                .entry(id.clone())
                .and_modify(|entry| {
                    entry.patch.merge(patch);
                    entry.applied_at = now;
                    entry.shielded |= shielded;
                })
                .or_insert_with(|| OptimisticEntry {
                    patch: patch.clone(),
                    applied_at: now,
                    shielded,
                });
            Some(before)
        })
    }

    /// Add a locally created or restored shape. An existing shape with the
    /// same id is replaced.
    pub fn insert_local(&self, shape: Shape) {
        let now = Instant::now();
        self.mutate(|inner| {
            inner.tombstones.remove(&shape.id);
            inner.pending.insert(shape.id.clone(), now);
            match inner.position(&shape.id) {
                Some(index) => inner.shapes[index] = shape,
                None => inner.shapes.push(shape),
            }
        });
    }

    /// Remove a shape from the view. Durable ids leave a tombstone so a
    /// stale snapshot cannot bring the shape back before the delete lands.
    pub fn remove_local(&self, id: &ShapeId) -> Option<Shape> {
        let now = Instant::now();
        self.mutate(|inner| {
            inner.overlay.remove(id);
            let was_pending = inner.pending.remove(id).is_some();
            let index = inner.position(id)?;
            let removed = inner.shapes.remove(index);
            if !id.is_temporary() && !was_pending {
                inner.tombstones.insert(id.clone(), now);
            }
            Some(removed)
        })
    }

    /// Swap a temporary id for the durable id the store assigned.
    ///
    /// Returns `false` when the temporary shape is no longer in the view
    /// (it was deleted or undone while its creation was in flight); the
    /// caller owns cleanup of the durable copy in that case.
    pub fn replace_id(&self, temp_id: &ShapeId, durable_id: &ShapeId) -> bool {
        let now = Instant::now();
        self.mutate(|inner| {
            inner.pending.remove(temp_id);
            let Some(index) = inner.position(temp_id) else {
                inner.overlay.remove(temp_id);
                return false;
            };

            if inner.position(durable_id).is_some() {
                // The snapshot carrying the durable shape arrived first.
                inner.shapes.remove(index);
            } else {
                inner.shapes[index].id = durable_id.clone();
                inner.pending.insert(durable_id.clone(), now);
            }
            if let Some(entry) = inner.overlay.remove(temp_id) {
                inner.overlay.insert(durable_id.clone(), entry);
            }
            true
        })
    }

    /// Reconcile a store snapshot with local state.
    pub fn ingest_snapshot(&self, snapshot: &Snapshot) -> MergeReport {
        let now = Instant::now();
        let ttl = self.ttl;
        let report = self.mutate(|inner| {
            let mut report = MergeReport {
                expired: inner.prune(now, ttl),
                ..Default::default()
            };

            let incoming_ids: HashSet<&ShapeId> = snapshot.shapes.iter().map(|s| &s.id).collect();
            // A deletion the store has echoed needs no tombstone.
            inner.tombstones.retain(|id, _| incoming_ids.contains(id));

            let mut merged = Vec::with_capacity(snapshot.shapes.len() + inner.pending.len());
            for incoming in &snapshot.shapes {
                if inner.tombstones.contains_key(&incoming.id) {
                    report.suppressed += 1;
                    continue;
                }
                inner.pending.remove(&incoming.id);

                let mut shape = incoming.clone();
                let verdict = inner.overlay.get(&incoming.id).map(|entry| {
                    if incoming.held_by_other(&self.actor).is_some() {
                        Verdict::Override
                    } else if entry.patch.matches(incoming) {
                        Verdict::Confirmed
                    } else if entry.shielded {
                        Verdict::Layer(entry.patch.clone())
                    } else {
                        Verdict::Override
                    }
                });
                match verdict {
                    Some(Verdict::Layer(patch)) => {
                        patch.apply_to(&mut shape);
                        report.layered += 1;
                    }
                    Some(Verdict::Confirmed) => {
                        inner.overlay.remove(&incoming.id);
                        report.confirmed += 1;
                    }
                    Some(Verdict::Override) => {
                        inner.overlay.remove(&incoming.id);
                        report.overridden += 1;
                    }
                    None => {}
                }
                merged.push(shape);
            }

            for shape in &inner.shapes {
                if !incoming_ids.contains(&shape.id) && inner.pending.contains_key(&shape.id) {
                    merged.push(shape.clone());
                    report.pending += 1;
                }
            }
            // Ids the store no longer has cannot carry overlay entries.
            inner
                .overlay
                .retain(|id, _| incoming_ids.contains(id) || inner.pending.contains_key(id));

            report.shapes = merged.len();
            inner.shapes = merged;
            report
        });

        tracing::trace!(
            revision = snapshot.revision,
            shapes = report.shapes,
            layered = report.layered,
            confirmed = report.confirmed,
            overridden = report.overridden,
            "Snapshot ingested",
        );
        report
    }

    /// Drop expired overlay entries, tombstones and durable pending inserts
    /// without waiting for the next snapshot.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let ttl = self.ttl;
        let mut inner = self.lock();
        inner.prune(now, ttl)
    }

    /// Empty the view. Durable shapes leave tombstones.
    pub fn clear(&self) {
        let now = Instant::now();
        self.mutate(|inner| {
            let durable: Vec<ShapeId> = inner
                .shapes
                .iter()
                .map(|s| s.id.clone())
                .filter(|id| !id.is_temporary() && !inner.pending.contains_key(id))
                .collect();
            inner.shapes.clear();
            inner.overlay.clear();
            inner.pending.clear();
            for id in durable {
                inner.tombstones.insert(id, now);
            }
        });
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = self.lock();
        let result = f(&mut inner);
        self.view.send_replace(Arc::new(inner.shapes.clone()));
        result
    }
}

enum Verdict {
    Layer(ShapePatch),
    Confirmed,
    Override,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
