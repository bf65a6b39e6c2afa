//! The per-user collaboration facade.
//!
//! [`CanvasClient`] ties the pieces together for one actor: every mutation
//! lands in [`CanvasState`] first, is recorded in history, and is then
//! proposed to the store by an ordered background writer (single edits) or
//! through the [`BatchPipeline`] (creation). Lock calls go through the
//! [`LockManager`] and every externally triggered action runs under a
//! deadline.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use canvas_core::collaboration::{validate_color, validate_owner_id};
use canvas_core::retry::{retry, RetryPolicy};
use canvas_core::shape::{Shape, ShapePatch, ShapeSpec};
use canvas_core::types::{Owner, OwnerId, ShapeId};
use canvas_events::{CanvasEvent, EventBus};
use canvas_store::{Decision, ShapeStore, StoreError, TxResult};
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::actions::{with_timeout, ActionScope};
use crate::batch::{BatchPipeline, FlushReport, PipelineContext};
use crate::config::CollabConfig;
use crate::error::{CollabError, CollabResult};
use crate::history::{HistoryAction, HistoryManager, HistoryStep, ShapeHandle};
use crate::locks::{AcquireOutcome, LockManager, ReleaseOutcome};
use crate::state::CanvasState;

// ---------------------------------------------------------------------------
// Background writes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Write {
    Update { id: ShapeId, patch: ShapePatch },
    Delete(ShapeId),
}

impl Write {
    fn shape_id(&self) -> &ShapeId {
        match self {
            Write::Update { id, .. } | Write::Delete(id) => id,
        }
    }

    fn operation(&self) -> &'static str {
        match self {
            Write::Update { .. } => "shape.update",
            Write::Delete(_) => "shape.delete",
        }
    }
}

/// What the store made of a background write.
#[derive(Debug, Clone, PartialEq)]
enum Applied {
    Done,
    /// Somebody else holds the shape's lock; nothing was written.
    Refused(OwnerId),
    Missing,
}

impl Applied {
    fn into_result(self, write: &Write) -> CollabResult<()> {
        match (self, write) {
            (Applied::Done, _) | (Applied::Missing, Write::Delete(_)) => Ok(()),
            (Applied::Refused(held_by), _) => Err(CollabError::LockedByOther {
                shape_id: write.shape_id().clone(),
                held_by,
            }),
            (Applied::Missing, Write::Update { id, .. }) => Err(CollabError::NotFound(id.clone())),
        }
    }
}

/// Apply one write, refusing it if another owner holds the lock.
async fn perform(store: &dyn ShapeStore, actor: &OwnerId, write: &Write) -> Result<Applied, StoreError> {
    match write {
        Write::Update { id, patch } => {
            let decide = |current: Option<&Shape>| match current {
                Some(shape) if shape.held_by_other(actor).is_none() => {
                    let mut next = shape.clone();
                    patch.apply_to(&mut next);
                    next.touch(actor);
                    Decision::Put(next)
                }
                _ => Decision::Abort,
            };
            Ok(match store.transact(id, &decide).await? {
                TxResult::Committed(_) => Applied::Done,
                TxResult::Aborted(Some(shape)) => match shape.held_by_other(actor) {
                    Some(holder) => Applied::Refused(holder.clone()),
                    None => Applied::Done,
                },
                TxResult::Aborted(None) => Applied::Missing,
            })
        }
        Write::Delete(id) => {
            let Some(current) = store.read_versioned(id).await? else {
                return Ok(Applied::Missing);
            };
            if let Some(holder) = current.shape.held_by_other(actor) {
                return Ok(Applied::Refused(holder.clone()));
            }
            Ok(if store.delete(id).await? {
                Applied::Done
            } else {
                Applied::Missing
            })
        }
    }
}

enum WriterCommand {
    Write(Write),
    /// Reply once every write queued before this one has been handled.
    Drain(oneshot::Sender<()>),
}

/// Applies one client's single-shape writes strictly in submission order.
struct Writer {
    actor: OwnerId,
    store: Arc<dyn ShapeStore>,
    policy: RetryPolicy,
    limit: Duration,
    events: Option<Arc<EventBus>>,
}

impl Writer {
    async fn run(self, mut commands: mpsc::UnboundedReceiver<WriterCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                WriterCommand::Write(write) => self.handle(&write).await,
                WriterCommand::Drain(reply) => {
                    let _ = reply.send(());
                }
            }
        }
        tracing::debug!(owner = %self.actor, "Background writer stopped");
    }

    async fn handle(&self, write: &Write) {
        let operation = write.operation();
        let result = with_timeout(operation, self.limit, self.events.as_deref(), self.attempt(write)).await;
        let Err(e) = result else {
            return;
        };
        tracing::warn!(
            shape_id = %write.shape_id(),
            operation,
            error = %e,
            "Background write failed",
        );
        if let Some(bus) = &self.events {
            bus.publish(CanvasEvent::WriteFailed {
                shape_id: write.shape_id().clone(),
                error: e.to_string(),
            });
        }
    }

    async fn attempt(&self, write: &Write) -> CollabResult<()> {
        let store = self.store.as_ref();
        let actor = &self.actor;
        let applied = retry(&self.policy, write.operation(), move || perform(store, actor, write)).await?;
        applied.into_result(write)
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Per-shape outcome of [`CanvasClient::update_shapes`].
#[derive(Debug, Default)]
pub struct BulkReport {
    pub updated: Vec<ShapeId>,
    /// Shapes left alone because somebody else holds their lock.
    pub skipped: Vec<(ShapeId, OwnerId)>,
    pub failed: Vec<(ShapeId, CollabError)>,
}

// ---------------------------------------------------------------------------
// CanvasClient
// ---------------------------------------------------------------------------

/// One actor's connection to a shared canvas.
pub struct CanvasClient {
    owner: Owner,
    config: CollabConfig,
    store: Arc<dyn ShapeStore>,
    state: Arc<CanvasState>,
    history: Arc<Mutex<HistoryManager>>,
    history_gate: tokio::sync::Mutex<()>,
    locks: Arc<LockManager>,
    batch: BatchPipeline,
    writer: mpsc::UnboundedSender<WriterCommand>,
    events: Option<Arc<EventBus>>,
}

impl CanvasClient {
    /// Build a client for `owner`. Must be called inside a tokio runtime.
    pub fn new(owner: Owner, store: Arc<dyn ShapeStore>, config: CollabConfig) -> CollabResult<Self> {
        Self::build(owner, store, config, None)
    }

    /// Like [`CanvasClient::new`], publishing lock, batch and failure events
    /// on `events`.
    pub fn with_events(
        owner: Owner,
        store: Arc<dyn ShapeStore>,
        config: CollabConfig,
        events: Arc<EventBus>,
    ) -> CollabResult<Self> {
        Self::build(owner, store, config, Some(events))
    }

    fn build(
        owner: Owner,
        store: Arc<dyn ShapeStore>,
        config: CollabConfig,
        events: Option<Arc<EventBus>>,
    ) -> CollabResult<Self> {
        validate_owner_id(&owner.id)?;
        validate_color(&owner.color)?;

        let state = Arc::new(CanvasState::new(owner.id.clone(), config.overlay_ttl));
        let history = Arc::new(Mutex::new(HistoryManager::new(config.history_depth)));
        let mut locks = LockManager::new(Arc::clone(&store), config.retry.clone());
        if let Some(bus) = &events {
            locks = locks.with_events(Arc::clone(bus));
        }
        let batch = BatchPipeline::spawn(PipelineContext {
            actor: owner.id.clone(),
            store: Arc::clone(&store),
            state: Arc::clone(&state),
            history: Arc::clone(&history),
            retry: config.retry.clone(),
            events: events.clone(),
            debounce: config.batch_debounce,
            max_wait: config.batch_max_wait,
            max_batch_size: config.max_batch_size,
        });

        let (writer, commands) = mpsc::unbounded_channel();
        let background = Writer {
            actor: owner.id.clone(),
            store: Arc::clone(&store),
            policy: config.retry.clone(),
            limit: config.single_timeout,
            events: events.clone(),
        };
        tokio::spawn(background.run(commands));

        tracing::debug!(owner = %owner.id, "Canvas client created");
        Ok(Self {
            owner,
            config,
            store,
            state,
            history,
            history_gate: tokio::sync::Mutex::new(()),
            locks: Arc::new(locks),
            batch,
            writer,
            events,
        })
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    pub fn state(&self) -> &Arc<CanvasState> {
        &self.state
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn shapes(&self) -> Arc<Vec<Shape>> {
        self.state.shapes()
    }

    pub fn can_undo(&self) -> bool {
        self.history().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history().can_redo()
    }

    /// Feed store snapshots into local state until `cancel` fires.
    pub fn start_sync(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let mut snapshots = self.store.subscribe();
        let state = Arc::clone(&self.state);
        let owner = self.owner.id.clone();
        tokio::spawn(async move {
            loop {
                let snapshot = Arc::clone(&snapshots.borrow_and_update());
                state.ingest_snapshot(&snapshot);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = snapshots.changed() => {
                        if changed.is_err() {
                            tracing::warn!(owner = %owner, "Snapshot stream closed");
                            break;
                        }
                    }
                }
            }
            tracing::debug!(owner = %owner, "Snapshot sync stopped");
        })
    }

    // -- creation ------------------------------------------------------------

    /// Create one shape. It is visible immediately under a temporary id.
    pub fn create_shape(&self, spec: &ShapeSpec) -> CollabResult<ShapeId> {
        self.batch.enqueue(spec)
    }

    /// Create many shapes. Nothing is created if any spec is invalid.
    pub fn create_shapes(&self, specs: &[ShapeSpec]) -> CollabResult<Vec<ShapeId>> {
        for spec in specs {
            spec.validate()?;
        }
        specs.iter().map(|spec| self.batch.enqueue(spec)).collect()
    }

    /// Persist pending creations now.
    pub async fn flush(&self) -> CollabResult<FlushReport> {
        self.batch.flush().await
    }

    /// Flush pending creations and wait for every background write.
    pub async fn settle(&self) -> CollabResult<()> {
        self.batch.flush().await?;
        self.drain_writes().await
    }

    // -- single-shape edits ----------------------------------------------------

    /// Apply `patch` locally, record it for undo, and persist it in the
    /// background. Refused when somebody else holds the shape's lock.
    pub fn update_shape(&self, id: &ShapeId, patch: &ShapePatch) -> CollabResult<()> {
        let patch = patch.without_lock_fields();
        if patch.is_empty() {
            return Ok(());
        }
        self.ensure_editable(id)?;
        let before = self
            .state
            .apply_local(id, &patch)
            .ok_or_else(|| CollabError::NotFound(id.clone()))?;
        self.history().record(HistoryAction::Update {
            shape_id: id.clone(),
            previous: patch.capture_from(&before),
            next: patch.clone(),
        });
        self.persist(Write::Update {
            id: id.clone(),
            patch,
        });
        Ok(())
    }

    /// Apply `patch` locally and persist it without recording history.
    /// Meant for continuous interactions such as drag frames.
    pub fn apply_live(&self, id: &ShapeId, patch: &ShapePatch) -> CollabResult<()> {
        let patch = patch.without_lock_fields();
        self.ensure_editable(id)?;
        self.state
            .apply_local(id, &patch)
            .ok_or_else(|| CollabError::NotFound(id.clone()))?;
        self.persist(Write::Update {
            id: id.clone(),
            patch,
        });
        Ok(())
    }

    /// Remove a shape locally, record it for undo, and delete it in the
    /// background.
    pub fn delete_shape(&self, id: &ShapeId) -> CollabResult<()> {
        self.ensure_editable(id)?;
        let removed = self
            .state
            .remove_local(id)
            .ok_or_else(|| CollabError::NotFound(id.clone()))?;
        self.history().record(HistoryAction::Delete(removed));
        self.persist(Write::Delete(id.clone()));
        Ok(())
    }

    // -- locks -----------------------------------------------------------------

    pub async fn lock_shape(&self, id: &ShapeId) -> CollabResult<AcquireOutcome> {
        let outcome = self
            .timed("shape.lock", ActionScope::Single, async {
                self.locks
                    .acquire(id, &self.owner)
                    .await
                    .map_err(CollabError::from)
            })
            .await?;
        if let AcquireOutcome::Acquired(_) = &outcome {
            self.state.apply_local(id, &ShapePatch::lock(&self.owner));
        }
        Ok(outcome)
    }

    /// Release the lock, committing `final_state` in the same transaction.
    /// A non-empty final state is recorded for undo once the release lands.
    pub async fn unlock_shape(
        &self,
        id: &ShapeId,
        final_state: Option<&ShapePatch>,
    ) -> CollabResult<ReleaseOutcome> {
        self.timed("shape.unlock", ActionScope::Single, self.release_with(id, final_state))
            .await
    }

    async fn release_with(
        &self,
        id: &ShapeId,
        final_state: Option<&ShapePatch>,
    ) -> CollabResult<ReleaseOutcome> {
        let final_state = final_state
            .map(ShapePatch::without_lock_fields)
            .filter(|patch| !patch.is_empty());

        // Queued drag frames must land while the lock is still ours.
        self.drain_writes().await?;

        let mut local = final_state.clone().unwrap_or_default();
        local.merge(&ShapePatch::unlock());
        let before = self.state.apply_local(id, &local);

        let outcome = match self.locks.release(id, &self.owner.id, final_state.as_ref()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.revert(id, &local, before.as_ref());
                return Err(e.into());
            }
        };

        match (&outcome, &final_state, &before) {
            (ReleaseOutcome::Released(_), Some(patch), Some(before)) => {
                self.history().record(HistoryAction::Update {
                    shape_id: id.clone(),
                    previous: patch.capture_from(before),
                    next: patch.clone(),
                });
            }
            (ReleaseOutcome::Released(_), _, _) => {}
            _ => self.revert(id, &local, before.as_ref()),
        }
        Ok(outcome)
    }

    // -- bulk ------------------------------------------------------------------

    /// Apply independent edits to many shapes in parallel. Each shape is
    /// locked, written and released on its own; shapes held by somebody
    /// else are skipped.
    pub async fn update_shapes(&self, updates: Vec<(ShapeId, ShapePatch)>) -> CollabResult<BulkReport> {
        self.timed("shapes.update", ActionScope::Bulk, async {
            let results = join_all(updates.into_iter().map(|(id, patch)| async move {
                let result = self.locked_update(&id, &patch).await;
                (id, result)
            }))
            .await;

            let mut report = BulkReport::default();
            for (id, result) in results {
                match result {
                    Ok(None) => report.updated.push(id),
                    Ok(Some(holder)) => report.skipped.push((id, holder)),
                    Err(e) => report.failed.push((id, e)),
                }
            }
            tracing::info!(
                updated = report.updated.len(),
                skipped = report.skipped.len(),
                failed = report.failed.len(),
                "Bulk update finished",
            );
            Ok(report)
        })
        .await
    }

    /// Returns the foreign holder if the shape was skipped.
    async fn locked_update(&self, id: &ShapeId, patch: &ShapePatch) -> CollabResult<Option<OwnerId>> {
        let already_ours = self
            .state
            .get(id)
            .is_some_and(|shape| shape.is_locked_by(&self.owner.id));
        if already_ours {
            self.update_shape(id, patch)?;
            return Ok(None);
        }

        match self.locks.acquire(id, &self.owner).await? {
            AcquireOutcome::Acquired(_) => {}
            AcquireOutcome::AlreadyLocked { held_by, .. } => return Ok(Some(held_by)),
            AcquireOutcome::Missing => return Err(CollabError::NotFound(id.clone())),
        }
        match self.release_with(id, Some(patch)).await? {
            ReleaseOutcome::Released(_) => Ok(None),
            ReleaseOutcome::NotOwner { held_by: Some(holder) } => Ok(Some(holder)),
            ReleaseOutcome::NotOwner { held_by: None } | ReleaseOutcome::Missing => {
                Err(CollabError::NotFound(id.clone()))
            }
        }
    }

    /// Delete every shape on the canvas. History is cleared.
    pub async fn clear_all(&self) -> CollabResult<u64> {
        let store = &self.store;
        let removed = self
            .timed("canvas.clear", ActionScope::Bulk, async {
                retry(&self.config.retry, "canvas.clear", move || store.delete_all())
                    .await
                    .map_err(CollabError::from)
            })
            .await?;
        self.state.clear();
        self.history().clear();
        tracing::info!(owner = %self.owner.id, removed, "Canvas cleared");
        Ok(removed)
    }

    // -- history ---------------------------------------------------------------

    /// Undo the most recent action. Returns `false` when there is nothing
    /// to undo. On error the history is left unchanged.
    pub async fn undo(&self) -> CollabResult<bool> {
        let _gate = self.history_gate.lock().await;
        let Some(pending) = self.history().peek_undo() else {
            return Ok(false);
        };
        self.timed("history.undo", ActionScope::Single, self.apply_step(pending.handle, &pending.step))
            .await?;
        self.history().commit_undo(pending.seq);
        Ok(true)
    }

    /// Redo the most recently undone action.
    pub async fn redo(&self) -> CollabResult<bool> {
        let _gate = self.history_gate.lock().await;
        let Some(pending) = self.history().peek_redo() else {
            return Ok(false);
        };
        self.timed("history.redo", ActionScope::Single, self.apply_step(pending.handle, &pending.step))
            .await?;
        self.history().commit_redo(pending.seq);
        Ok(true)
    }

    async fn apply_step(&self, handle: ShapeHandle, step: &HistoryStep) -> CollabResult<()> {
        match step {
            HistoryStep::Patch { shape_id, patch } => {
                if !self.state.contains(shape_id) {
                    tracing::debug!(shape_id = %shape_id, "History target is gone, skipping");
                    return Ok(());
                }
                self.ensure_editable(shape_id)?;
                let before = self
                    .state
                    .apply_local(shape_id, patch)
                    .ok_or_else(|| CollabError::NotFound(shape_id.clone()))?;
                if shape_id.is_temporary() {
                    return Ok(());
                }
                let write = Write::Update {
                    id: shape_id.clone(),
                    patch: patch.clone(),
                };
                if let Err(e) = self.write_now(&write).await {
                    self.revert(shape_id, patch, Some(&before));
                    return Err(e);
                }
                Ok(())
            }

            HistoryStep::Remove { shape_id, shape } => {
                let target = match self.state.get(shape_id) {
                    Some(target) => target,
                    // The creation landed but the id swap never reached us.
                    None if shape_id.is_temporary() => match self.state.find_same_content(shape) {
                        Some(found) => {
                            self.history().rebind(handle, found.id.clone());
                            found
                        }
                        None => return Ok(()),
                    },
                    None => {
                        tracing::debug!(shape_id = %shape_id, "History target is gone, skipping");
                        return Ok(());
                    }
                };
                self.ensure_editable(&target.id)?;
                let removed = self
                    .state
                    .remove_local(&target.id)
                    .ok_or_else(|| CollabError::NotFound(target.id.clone()))?;
                if target.id.is_temporary() {
                    // The pipeline skips or discards it.
                    return Ok(());
                }
                if let Err(e) = self.write_now(&Write::Delete(target.id.clone())).await {
                    self.state.insert_local(removed);
                    return Err(e);
                }
                Ok(())
            }

            HistoryStep::Restore(shape) => {
                let mut shape = shape.clone();
                ShapePatch::unlock().apply_to(&mut shape);
                shape.touch(&self.owner.id);

                if shape.id.is_temporary() {
                    return self.batch.requeue(shape);
                }
                self.state.insert_local(shape.clone());
                let store = &self.store;
                let restored = &shape;
                if let Err(e) = retry(&self.config.retry, "shape.restore", move || {
                    store.put(restored.clone())
                })
                .await
                {
                    self.state.remove_local(&shape.id);
                    return Err(e.into());
                }
                Ok(())
            }
        }
    }

    // -- helpers ---------------------------------------------------------------

    fn history(&self) -> MutexGuard<'_, HistoryManager> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_editable(&self, id: &ShapeId) -> CollabResult<()> {
        let shape = self
            .state
            .get(id)
            .ok_or_else(|| CollabError::NotFound(id.clone()))?;
        match shape.held_by_other(&self.owner.id) {
            Some(holder) => Err(CollabError::LockedByOther {
                shape_id: id.clone(),
                held_by: holder.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Undo an optimistic local write after its durable counterpart failed.
    fn revert(&self, id: &ShapeId, applied: &ShapePatch, before: Option<&Shape>) {
        if let Some(before) = before {
            self.state.apply_local(id, &applied.capture_from(before));
        }
    }

    async fn timed<T>(
        &self,
        operation: &'static str,
        scope: ActionScope,
        fut: impl std::future::Future<Output = CollabResult<T>>,
    ) -> CollabResult<T> {
        with_timeout(operation, scope.limit(&self.config), self.events.as_deref(), fut).await
    }

    /// Write after everything already queued, and wait for the outcome.
    async fn write_now(&self, write: &Write) -> CollabResult<()> {
        self.drain_writes().await?;
        let store = self.store.as_ref();
        let actor = &self.owner.id;
        let applied = retry(&self.config.retry, write.operation(), move || {
            perform(store, actor, write)
        })
        .await?;
        applied.into_result(write)
    }

    /// Wait until the background writer has handled everything queued so far.
    async fn drain_writes(&self) -> CollabResult<()> {
        let (reply, done) = oneshot::channel();
        self.writer
            .send(WriterCommand::Drain(reply))
            .map_err(|_| CollabError::PipelineClosed)?;
        done.await.map_err(|_| CollabError::PipelineClosed)
    }

    /// Queue a durable write behind every earlier one. Temporary ids are
    /// skipped; the batch pipeline persists their latest local content.
    fn persist(&self, write: Write) {
        if write.shape_id().is_temporary() {
            return;
        }
        if self.writer.send(WriterCommand::Write(write)).is_err() {
            tracing::error!(owner = %self.owner.id, "Background writer is gone, dropping write");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
