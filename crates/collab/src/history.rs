//! Linear undo/redo history.
//!
//! Recorded actions never store shape ids directly. Each action refers to a
//! [`ShapeHandle`], and a single handle-to-id table is rewritten when a
//! temporary id is swapped for its durable counterpart, so every entry that
//! mentions the shape follows along.
//!
//! Undo and redo are two-phase: [`HistoryManager::peek_undo`] hands out the
//! inverse step without touching the stacks, and the caller commits it
//! with [`HistoryManager::commit_undo`] once the step has been applied. A
//! failed application therefore leaves history exactly as it was.

use std::collections::{HashMap, VecDeque};

use canvas_core::shape::{Shape, ShapePatch};
use canvas_core::types::{ShapeId, Timestamp};
use chrono::Utc;

/// Stable local reference to a shape across id reassignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShapeHandle(u64);

/// A user-visible mutation, as reported by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryAction {
    Add(Shape),
    Update {
        shape_id: ShapeId,
        previous: ShapePatch,
        next: ShapePatch,
    },
    Delete(Shape),
}

#[derive(Debug, Clone)]
enum Recorded {
    Add(Shape),
    Update { previous: ShapePatch, next: ShapePatch },
    Delete(Shape),
}

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    handle: ShapeHandle,
    action: Recorded,
    at: Timestamp,
}

/// The concrete change an undo or redo asks the caller to apply.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryStep {
    /// Remove the shape currently known as `shape_id`. `shape` is the
    /// recorded content, for matching when the id can no longer be found.
    Remove { shape_id: ShapeId, shape: Shape },
    /// Bring `shape` back under its current id.
    Restore(Shape),
    /// Write `patch` to `shape_id`.
    Patch { shape_id: ShapeId, patch: ShapePatch },
}

/// An undo or redo step waiting to be applied and committed.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingStep {
    pub seq: u64,
    pub handle: ShapeHandle,
    pub step: HistoryStep,
    /// When the underlying action was originally recorded.
    pub recorded_at: Timestamp,
}

/// Undo and redo stacks over handle-addressed actions.
#[derive(Debug)]
pub struct HistoryManager {
    undo: VecDeque<Entry>,
    redo: Vec<Entry>,
    ids: HashMap<ShapeHandle, ShapeId>,
    handles: HashMap<ShapeId, ShapeHandle>,
    next_handle: u64,
    next_seq: u64,
    max_depth: usize,
}

impl HistoryManager {
    pub fn new(max_depth: usize) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: Vec::new(),
            ids: HashMap::new(),
            handles: HashMap::new(),
            next_handle: 0,
            next_seq: 0,
            max_depth: max_depth.max(1),
        }
    }

    /// Push an action onto the undo stack and clear the redo stack.
    pub fn record(&mut self, action: HistoryAction) -> ShapeHandle {
        let (shape_id, recorded) = match action {
            HistoryAction::Add(shape) => (shape.id.clone(), Recorded::Add(shape)),
            HistoryAction::Update {
                shape_id,
                previous,
                next,
            } => (shape_id, Recorded::Update { previous, next }),
            HistoryAction::Delete(shape) => (shape.id.clone(), Recorded::Delete(shape)),
        };
        let handle = self.handle_for(&shape_id);

        self.next_seq += 1;
        self.undo.push_back(Entry {
            seq: self.next_seq,
            handle,
            action: recorded,
            at: Utc::now(),
        });
        if self.undo.len() > self.max_depth {
            self.undo.pop_front();
        }
        self.redo.clear();
        self.collect_handles();
        handle
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    /// The id a handle currently resolves to.
    pub fn id_of(&self, handle: ShapeHandle) -> Option<&ShapeId> {
        self.ids.get(&handle)
    }

    /// The inverse of the most recent action.
    pub fn peek_undo(&self) -> Option<PendingStep> {
        let entry = self.undo.back()?;
        let shape_id = self.ids.get(&entry.handle)?.clone();
        let step = match &entry.action {
            Recorded::Add(shape) => HistoryStep::Remove {
                shape_id,
                shape: shape.clone(),
            },
            Recorded::Update { previous, .. } => HistoryStep::Patch {
                shape_id,
                patch: previous.clone(),
            },
            Recorded::Delete(shape) => HistoryStep::Restore(with_id(shape, shape_id)),
        };
        Some(PendingStep {
            seq: entry.seq,
            handle: entry.handle,
            step,
            recorded_at: entry.at,
        })
    }

    /// Move the top undo entry to the redo stack if it is still `seq`.
    pub fn commit_undo(&mut self, seq: u64) -> bool {
        if self.undo.back().map(|e| e.seq) != Some(seq) {
            return false;
        }
        if let Some(entry) = self.undo.pop_back() {
            self.redo.push(entry);
        }
        true
    }

    /// The re-application of the most recently undone action.
    pub fn peek_redo(&self) -> Option<PendingStep> {
        let entry = self.redo.last()?;
        let shape_id = self.ids.get(&entry.handle)?.clone();
        let step = match &entry.action {
            Recorded::Add(shape) => HistoryStep::Restore(with_id(shape, shape_id)),
            Recorded::Update { next, .. } => HistoryStep::Patch {
                shape_id,
                patch: next.clone(),
            },
            Recorded::Delete(shape) => HistoryStep::Remove {
                shape_id,
                shape: shape.clone(),
            },
        };
        Some(PendingStep {
            seq: entry.seq,
            handle: entry.handle,
            step,
            recorded_at: entry.at,
        })
    }

    /// Move the top redo entry back to the undo stack if it is still `seq`.
    pub fn commit_redo(&mut self, seq: u64) -> bool {
        if self.redo.last().map(|e| e.seq) != Some(seq) {
            return false;
        }
        if let Some(entry) = self.redo.pop() {
            self.undo.push_back(entry);
            if self.undo.len() > self.max_depth {
                self.undo.pop_front();
            }
        }
        true
    }

    /// Point every entry that referenced `temp_id` at `durable_id`.
    pub fn remap_id(&mut self, temp_id: &ShapeId, durable_id: &ShapeId) -> bool {
        let Some(handle) = self.handles.remove(temp_id) else {
            return false;
        };
        self.rebind(handle, durable_id.clone());
        true
    }

    /// Make `handle` resolve to `id` from now on.
    pub fn rebind(&mut self, handle: ShapeHandle, id: ShapeId) {
        if let Some(old) = self.ids.insert(handle, id.clone()) {
            if old != id {
                self.handles.remove(&old);
            }
        }
        if let Some(previous) = self.handles.insert(id, handle) {
            if previous != handle {
                // Two handles for one id: fold the older one into this one.
                for entry in self.undo.iter_mut().chain(self.redo.iter_mut()) {
                    if entry.handle == previous {
                        entry.handle = handle;
                    }
                }
                self.ids.remove(&previous);
            }
        }
    }

    /// Drop every entry that refers to `shape_id`, e.g. after its creation
    /// was rolled back. Returns the number of entries removed.
    pub fn forget(&mut self, shape_id: &ShapeId) -> usize {
        let Some(handle) = self.handles.remove(shape_id) else {
            return 0;
        };
        self.ids.remove(&handle);
        let before = self.undo.len() + self.redo.len();
        self.undo.retain(|e| e.handle != handle);
        self.redo.retain(|e| e.handle != handle);
        before - (self.undo.len() + self.redo.len())
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
        self.ids.clear();
        self.handles.clear();
    }

    fn handle_for(&mut self, shape_id: &ShapeId) -> ShapeHandle {
        if let Some(handle) = self.handles.get(shape_id) {
            return *handle;
        }
        self.next_handle += 1;
        let handle = ShapeHandle(self.next_handle);
        self.handles.insert(shape_id.clone(), handle);
        self.ids.insert(handle, shape_id.clone());
        handle
    }

    /// Drop table rows no entry refers to anymore.
    fn collect_handles(&mut self) {
        if self.ids.len() <= self.undo.len() + self.redo.len() {
            return;
        }
        let live: std::collections::HashSet<ShapeHandle> = self
            .undo
            .iter()
            .chain(self.redo.iter())
            .map(|e| e.handle)
            .collect();
        self.ids.retain(|handle, _| live.contains(handle));
        self.handles.retain(|_, handle| live.contains(handle));
    }
}

impl Default for HistoryManager {
    fn default() -> Self {
        Self::new(canvas_core::collaboration::MAX_HISTORY_DEPTH)
    }
}

fn with_id(shape: &Shape, id: ShapeId) -> Shape {
    let mut shape = shape.clone();
    shape.id = id;
    shape
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use canvas_core::shape::{ShapeKind, ShapeSpec};

    use super::*;

    fn shape(id: ShapeId) -> Shape {
        let spec = ShapeSpec::new(ShapeKind::Rectangle, 0.0, 0.0, 10.0, 10.0);
        Shape::from_spec(id, &spec, &"alice".into())
    }

    fn moved(shape_id: &ShapeId, from: f64, to: f64) -> HistoryAction {
        HistoryAction::Update {
            shape_id: shape_id.clone(),
            previous: ShapePatch::position(from, 0.0),
            next: ShapePatch::position(to, 0.0),
        }
    }

    fn undo(history: &mut HistoryManager) -> HistoryStep {
        let pending = history.peek_undo().unwrap();
        assert!(history.commit_undo(pending.seq));
        pending.step
    }

    fn redo(history: &mut HistoryManager) -> HistoryStep {
        let pending = history.peek_redo().unwrap();
        assert!(history.commit_redo(pending.seq));
        pending.step
    }

    #[test]
    fn undo_produces_inverse_steps() {
        let mut history = HistoryManager::default();
        let id = ShapeId::from("s1");
        history.record(HistoryAction::Add(shape(id.clone())));
        history.record(moved(&id, 0.0, 100.0));

        assert_eq!(
            undo(&mut history),
            HistoryStep::Patch {
                shape_id: id.clone(),
                patch: ShapePatch::position(0.0, 0.0)
            }
        );
        assert_matches!(undo(&mut history), HistoryStep::Remove { shape_id, .. } if shape_id == id);
        assert!(!history.can_undo());

        assert_matches!(redo(&mut history), HistoryStep::Restore(s) if s.id == id);
        assert_eq!(
            redo(&mut history),
            HistoryStep::Patch {
                shape_id: id,
                patch: ShapePatch::position(100.0, 0.0)
            }
        );
        assert!(!history.can_redo());
    }

    #[test]
    fn undo_of_delete_restores_full_shape() {
        let mut history = HistoryManager::default();
        let deleted = shape("s9".into());
        history.record(HistoryAction::Delete(deleted.clone()));
        assert_eq!(undo(&mut history), HistoryStep::Restore(deleted.clone()));
        assert_matches!(redo(&mut history), HistoryStep::Remove { shape, .. } if shape == deleted);
    }

    #[test]
    fn recording_clears_redo() {
        let mut history = HistoryManager::default();
        let id = ShapeId::from("s1");
        history.record(moved(&id, 0.0, 1.0));
        undo(&mut history);
        assert!(history.can_redo());
        history.record(moved(&id, 0.0, 2.0));
        assert!(!history.can_redo());
    }

    #[test]
    fn peek_without_commit_leaves_stacks_untouched() {
        let mut history = HistoryManager::default();
        history.record(moved(&"s1".into(), 0.0, 1.0));
        let pending = history.peek_undo().unwrap();
        assert_eq!(history.undo_len(), 1);
        assert_eq!(history.redo_len(), 0);

        // A stale commit is refused.
        history.record(moved(&"s1".into(), 1.0, 2.0));
        assert!(!history.commit_undo(pending.seq));
        assert_eq!(history.undo_len(), 2);
    }

    #[test]
    fn remap_rewrites_every_referencing_entry() {
        let mut history = HistoryManager::default();
        let temp = ShapeId::temporary();
        history.record(HistoryAction::Add(shape(temp.clone())));
        history.record(moved(&temp, 0.0, 50.0));

        let durable = ShapeId::from("d1");
        assert!(history.remap_id(&temp, &durable));

        assert_matches!(undo(&mut history), HistoryStep::Patch { shape_id, .. } if shape_id == durable);
        assert_matches!(undo(&mut history), HistoryStep::Remove { shape_id, .. } if shape_id == durable);
        assert_matches!(redo(&mut history), HistoryStep::Restore(s) if s.id == durable);
    }

    #[test]
    fn actions_recorded_after_remap_share_the_handle() {
        let mut history = HistoryManager::default();
        let temp = ShapeId::temporary();
        let handle = history.record(HistoryAction::Add(shape(temp.clone())));
        history.remap_id(&temp, &"d1".into());
        let later = history.record(moved(&"d1".into(), 0.0, 5.0));
        assert_eq!(handle, later);
    }

    #[test]
    fn remap_of_unknown_id_is_a_no_op() {
        let mut history = HistoryManager::default();
        assert!(!history.remap_id(&ShapeId::temporary(), &"d1".into()));
    }

    #[test]
    fn forget_drops_entries_for_rolled_back_shapes() {
        let mut history = HistoryManager::default();
        let kept = ShapeId::temporary();
        let rolled_back = ShapeId::temporary();
        history.record(HistoryAction::Add(shape(kept.clone())));
        history.record(HistoryAction::Add(shape(rolled_back.clone())));
        history.record(moved(&rolled_back, 0.0, 3.0));

        assert_eq!(history.forget(&rolled_back), 2);
        assert_eq!(history.undo_len(), 1);
        assert_matches!(undo(&mut history), HistoryStep::Remove { shape_id, .. } if shape_id == kept);
    }

    #[test]
    fn depth_is_capped() {
        let mut history = HistoryManager::new(3);
        for n in 0..5 {
            history.record(moved(&"s1".into(), n as f64, n as f64 + 1.0));
        }
        assert_eq!(history.undo_len(), 3);
        assert_eq!(
            undo(&mut history),
            HistoryStep::Patch {
                shape_id: "s1".into(),
                patch: ShapePatch::position(4.0, 0.0)
            }
        );
    }

    #[test]
    fn rebind_merges_duplicate_handles() {
        let mut history = HistoryManager::default();
        let a = history.record(moved(&"old".into(), 0.0, 1.0));
        let b = history.record(moved(&"new".into(), 0.0, 1.0));
        history.rebind(a, "new".into());
        assert_eq!(history.id_of(a), Some(&ShapeId::from("new")));
        assert_eq!(history.id_of(b), None);
        assert_matches!(undo(&mut history), HistoryStep::Patch { shape_id, .. } if shape_id == ShapeId::from("new"));
        assert_matches!(undo(&mut history), HistoryStep::Patch { shape_id, .. } if shape_id == ShapeId::from("new"));
    }
}
