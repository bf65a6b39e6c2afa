//! Debounced batch creation.
//!
//! [`BatchPipeline::enqueue`] makes a new shape visible locally under a
//! temporary id and hands the id to a background task. The task waits for a
//! quiet period, a full batch, or the maximum wait measured from the oldest
//! pending creation, then persists every pending shape with a
//! single multi-document write. Each acknowledged member has its temporary
//! id swapped for the durable one in local state and in history; each
//! rejected member is rolled back on its own.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use canvas_core::retry::{retry, RetryPolicy};
use canvas_core::shape::{Shape, ShapeSpec};
use canvas_core::types::{OwnerId, ShapeId};
use canvas_events::{CanvasEvent, EventBus};
use canvas_store::{ShapeStore, StoreError, WriteAck, WriteOp};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{CollabError, CollabResult};
use crate::history::{HistoryAction, HistoryManager};
use crate::state::CanvasState;

/// Outcome of one flush.
#[derive(Debug, Default)]
pub struct FlushReport {
    /// `(temporary id, durable id)` for every persisted member.
    pub created: Vec<(ShapeId, ShapeId)>,
    /// Members removed from local state because the store rejected them.
    pub rolled_back: Vec<(ShapeId, StoreError)>,
    /// Members deleted locally before the flush; nothing was written.
    pub skipped: usize,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.rolled_back.is_empty() && self.skipped == 0
    }
}

enum Command {
    Create(ShapeId),
    Flush(oneshot::Sender<FlushReport>),
}

/// Everything the background task needs.
pub struct PipelineContext {
    pub actor: OwnerId,
    pub store: Arc<dyn ShapeStore>,
    pub state: Arc<CanvasState>,
    pub history: Arc<Mutex<HistoryManager>>,
    pub retry: RetryPolicy,
    pub events: Option<Arc<EventBus>>,
    pub debounce: Duration,
    pub max_wait: Duration,
    pub max_batch_size: usize,
}

/// Handle to the batched creation task.
pub struct BatchPipeline {
    actor: OwnerId,
    state: Arc<CanvasState>,
    history: Arc<Mutex<HistoryManager>>,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl BatchPipeline {
    /// Start the background task. Must be called inside a tokio runtime.
    pub fn spawn(ctx: PipelineContext) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let actor = ctx.actor.clone();
        let state = Arc::clone(&ctx.state);
        let history = Arc::clone(&ctx.history);
        let task = tokio::spawn(run(ctx, rx));
        Self {
            actor,
            state,
            history,
            commands,
            task,
        }
    }

    /// Show a new shape immediately and queue it for persistence.
    /// Returns its temporary id.
    pub fn enqueue(&self, spec: &ShapeSpec) -> CollabResult<ShapeId> {
        spec.validate()?;
        let temp_id = ShapeId::temporary();
        let shape = Shape::from_spec(temp_id.clone(), spec, &self.actor);

        self.state.insert_local(shape.clone());
        lock(&self.history).record(HistoryAction::Add(shape));

        if self.commands.send(Command::Create(temp_id.clone())).is_err() {
            self.state.remove_local(&temp_id);
            lock(&self.history).forget(&temp_id);
            return Err(CollabError::PipelineClosed);
        }
        Ok(temp_id)
    }

    /// Put a previously created temporary shape back into the view and the
    /// queue, e.g. when undoing the deletion of a shape whose creation never
    /// landed. History is left alone.
    pub fn requeue(&self, shape: Shape) -> CollabResult<()> {
        let temp_id = shape.id.clone();
        self.state.insert_local(shape);
        if self.commands.send(Command::Create(temp_id.clone())).is_err() {
            self.state.remove_local(&temp_id);
            return Err(CollabError::PipelineClosed);
        }
        Ok(())
    }

    /// Persist everything pending right now and wait for the outcome.
    pub async fn flush(&self) -> CollabResult<FlushReport> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Flush(reply))
            .map_err(|_| CollabError::PipelineClosed)?;
        response.await.map_err(|_| CollabError::PipelineClosed)
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

async fn run(ctx: PipelineContext, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut pending: Vec<ShapeId> = Vec::new();
    let mut oldest: Option<Instant> = None;
    let mut deadline: Option<Instant> = None;

    loop {
        let wake_at = deadline.unwrap_or_else(Instant::now);
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Create(temp_id)) => {
                    let now = Instant::now();
                    let first = *oldest.get_or_insert(now);
                    pending.push(temp_id);
                    if pending.len() >= ctx.max_batch_size {
                        ctx.flush(std::mem::take(&mut pending)).await;
                        oldest = None;
                        deadline = None;
                    } else {
                        deadline = Some((now + ctx.debounce).min(first + ctx.max_wait));
                    }
                }
                Some(Command::Flush(reply)) => {
                    let report = ctx.flush(std::mem::take(&mut pending)).await;
                    oldest = None;
                    deadline = None;
                    let _ = reply.send(report);
                }
                None => {
                    if !pending.is_empty() {
                        ctx.flush(std::mem::take(&mut pending)).await;
                    }
                    tracing::debug!("Batch pipeline stopped");
                    break;
                }
            },
            _ = tokio::time::sleep_until(wake_at), if deadline.is_some() => {
                ctx.flush(std::mem::take(&mut pending)).await;
                oldest = None;
                deadline = None;
            }
        }
    }
}

impl PipelineContext {
    async fn flush(&self, temp_ids: Vec<ShapeId>) -> FlushReport {
        let mut report = FlushReport::default();
        if temp_ids.is_empty() {
            return report;
        }

        // Read the latest local content; shapes removed meanwhile are skipped.
        let mut members: Vec<(ShapeId, Shape)> = Vec::with_capacity(temp_ids.len());
        let mut seen = HashSet::with_capacity(temp_ids.len());
        for temp_id in temp_ids {
            if !seen.insert(temp_id.clone()) {
                continue;
            }
            match self.state.get(&temp_id) {
                Some(shape) => members.push((temp_id, shape)),
                None => report.skipped += 1,
            }
        }
        if members.is_empty() {
            return report;
        }

        let ops: Vec<WriteOp> = members
            .iter()
            .map(|(temp_id, shape)| WriteOp::Create {
                temp_id: temp_id.clone(),
                shape: shape.clone(),
            })
            .collect();
        let store = &self.store;
        let ops = &ops;
        let result = retry(&self.retry, "batch.write", move || {
            store.batch_write(ops.clone())
        })
        .await;

        match result {
            Ok(acks) => {
                let mut acks = acks.into_iter();
                for (temp_id, sent) in members {
                    match acks.next() {
                        Some(Ok(WriteAck::Created { id, .. })) => {
                            self.settle_created(&temp_id, &id, &sent).await;
                            report.created.push((temp_id, id));
                        }
                        Some(Ok(other)) => {
                            let err = StoreError::Malformed {
                                id: temp_id.to_string(),
                                reason: format!("unexpected acknowledgement {other:?}"),
                            };
                            self.roll_back(&temp_id, &err);
                            report.rolled_back.push((temp_id, err));
                        }
                        Some(Err(err)) => {
                            self.roll_back(&temp_id, &err);
                            report.rolled_back.push((temp_id, err));
                        }
                        None => {
                            let err = StoreError::Unavailable("batch acknowledgement missing".into());
                            self.roll_back(&temp_id, &err);
                            report.rolled_back.push((temp_id, err));
                        }
                    }
                }
            }
            Err(err) => {
                tracing::error!(members = members.len(), error = %err, "Batch write failed");
                for (temp_id, _) in members {
                    self.roll_back(&temp_id, &err);
                    report.rolled_back.push((temp_id, err.clone()));
                }
            }
        }

        tracing::info!(
            created = report.created.len(),
            rolled_back = report.rolled_back.len(),
            skipped = report.skipped,
            "Batch flushed",
        );
        if let Some(bus) = &self.events {
            bus.publish(CanvasEvent::BatchFlushed {
                created: report.created.len(),
                rolled_back: report.rolled_back.len(),
            });
        }
        report
    }

    async fn settle_created(&self, temp_id: &ShapeId, durable_id: &ShapeId, sent: &Shape) {
        // State before history; until the remap, undo resolves the shape by
        // content.
        let replaced = self.state.replace_id(temp_id, durable_id);
        lock(&self.history).remap_id(temp_id, durable_id);

        if !replaced {
            // Deleted or undone while in flight.
            let store = &self.store;
            if let Err(e) = retry(&self.retry, "batch.discard", move || store.delete(durable_id)).await {
                tracing::warn!(shape_id = %durable_id, error = %e, "Failed to discard orphaned shape");
            }
            return;
        }

        // Local edits made while the write was in flight.
        let Some(local) = self.state.get(durable_id) else {
            return;
        };
        if local.same_content(sent) {
            return;
        }
        let store = &self.store;
        let local = &local;
        if let Err(e) = retry(&self.retry, "batch.catch_up", move || store.put(local.clone())).await {
            tracing::warn!(shape_id = %durable_id, error = %e, "Failed to persist edits made during creation");
            if let Some(bus) = &self.events {
                bus.publish(CanvasEvent::WriteFailed {
                    shape_id: durable_id.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    fn roll_back(&self, temp_id: &ShapeId, err: &StoreError) {
        tracing::warn!(shape_id = %temp_id, error = %err, "Rolling back rejected creation");
        self.state.remove_local(temp_id);
        lock(&self.history).forget(temp_id);
        if let Some(bus) = &self.events {
            bus.publish(CanvasEvent::WriteFailed {
                shape_id: temp_id.clone(),
                error: err.to_string(),
            });
        }
    }
}

fn lock(history: &Mutex<HistoryManager>) -> MutexGuard<'_, HistoryManager> {
    history.lock().unwrap_or_else(PoisonError::into_inner)
}
