//! Server-side lock reaping for clients that vanished without unlocking.
//!
//! A client counts as absent when its presence record is gone, flagged
//! offline, or (when a staleness threshold is configured) has not been
//! renewed for too long. Absent clients become suspects; a suspect that
//! stays absent for the grace period is reaped and every lock it holds is
//! released. Reappearing during grace cancels the reap. A reap whose
//! release fails is retried on the next evaluation.
//!
//! [`ReaperState`] is the pure decision machine; [`LockReaper`] drives it
//! from the presence stream and a poll interval.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use canvas_core::presence::PresenceMap;
use canvas_core::types::{OwnerId, Timestamp};
use canvas_events::{CanvasEvent, EventBus};
use canvas_store::{PresenceChannel, ShapeStore, Snapshot};
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::actions::with_timeout;
use crate::config::ReaperConfig;
use crate::error::CollabError;
use crate::locks::LockManager;

// ---------------------------------------------------------------------------
// ReaperState
// ---------------------------------------------------------------------------

/// Where the reaper believes a client is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Online,
    /// Absent since `since`; reaped once the grace period has elapsed.
    Suspect { since: Instant },
    /// Locks released; waiting for the client to come back or be forgotten.
    Reaped,
}

/// Per-client liveness bookkeeping.
#[derive(Debug)]
pub struct ReaperState {
    config: ReaperConfig,
    clients: HashMap<OwnerId, ClientStatus>,
}

impl ReaperState {
    pub fn new(config: ReaperConfig) -> Self {
        Self {
            config,
            clients: HashMap::new(),
        }
    }

    pub fn status(&self, client_id: &OwnerId) -> Option<ClientStatus> {
        self.clients.get(client_id).copied()
    }

    /// Fold in the latest presence view and current lock holders, and
    /// return the clients whose locks should be released now.
    ///
    /// Returned clients are marked [`ClientStatus::Reaped`]; call
    /// [`ReaperState::reap_failed`] if releasing their locks did not
    /// complete.
    pub fn observe(
        &mut self,
        presence: &PresenceMap,
        lock_holders: &BTreeSet<OwnerId>,
        wall_now: Timestamp,
        now: Instant,
    ) -> Vec<OwnerId> {
        let mut candidates: BTreeSet<OwnerId> = presence.keys().cloned().collect();
        candidates.extend(self.clients.keys().cloned());
        if self.config.sweep_orphans {
            candidates.extend(lock_holders.iter().cloned());
        }

        let mut due = Vec::new();
        for client_id in candidates {
            let present = presence
                .get(&client_id)
                .is_some_and(|record| record.online && !self.is_stale(record.age(wall_now)));
            let holds_locks = lock_holders.contains(&client_id);
            let previous = self.clients.get(&client_id).copied();

            let next = match (present, previous) {
                (true, Some(ClientStatus::Suspect { .. } | ClientStatus::Reaped)) => {
                    tracing::info!(client_id = %client_id, "Client is back online");
                    Some(ClientStatus::Online)
                }
                (true, _) => Some(ClientStatus::Online),
                (false, None | Some(ClientStatus::Online)) => {
                    tracing::debug!(client_id = %client_id, "Client absent, grace period started");
                    Some(ClientStatus::Suspect { since: now })
                }
                (false, Some(ClientStatus::Suspect { since })) => {
                    if now.saturating_duration_since(since) >= self.config.grace {
                        due.push(client_id.clone());
                        Some(ClientStatus::Reaped)
                    } else {
                        Some(ClientStatus::Suspect { since })
                    }
                }
                // Locks reappeared under a reaped id; reap again after grace.
                (false, Some(ClientStatus::Reaped)) if holds_locks => {
                    Some(ClientStatus::Suspect { since: now })
                }
                (false, Some(ClientStatus::Reaped)) => {
                    if presence.contains_key(&client_id) {
                        Some(ClientStatus::Reaped)
                    } else {
                        None
                    }
                }
            };

            match next {
                Some(status) => {
                    self.clients.insert(client_id, status);
                }
                None => {
                    self.clients.remove(&client_id);
                }
            }
        }
        due
    }

    /// Put a client whose reap did not complete back into suspicion so the
    /// next evaluation retries it immediately.
    pub fn reap_failed(&mut self, client_id: &OwnerId, since: Instant) {
        self.clients
            .insert(client_id.clone(), ClientStatus::Suspect { since });
    }

    fn is_stale(&self, age: std::time::Duration) -> bool {
        self.config.stale_after.is_some_and(|limit| age > limit)
    }
}

// ---------------------------------------------------------------------------
// LockReaper
// ---------------------------------------------------------------------------

/// Counters exposed by a running reaper.
#[derive(Debug, Default)]
pub struct ReaperStats {
    pub clients_reaped: AtomicU64,
    pub locks_released: AtomicU64,
    pub failed_reaps: AtomicU64,
}

/// Watches presence and releases the locks of clients that are gone.
pub struct LockReaper {
    locks: Arc<LockManager>,
    presence: Arc<dyn PresenceChannel>,
    snapshots: watch::Receiver<Arc<Snapshot>>,
    config: ReaperConfig,
    events: Option<Arc<EventBus>>,
    stats: Arc<ReaperStats>,
}

impl LockReaper {
    pub fn new(
        store: Arc<dyn ShapeStore>,
        locks: Arc<LockManager>,
        presence: Arc<dyn PresenceChannel>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            snapshots: store.subscribe(),
            locks,
            presence,
            config,
            events: None,
            stats: Arc::new(ReaperStats::default()),
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn stats(&self) -> Arc<ReaperStats> {
        Arc::clone(&self.stats)
    }

    /// Run until `cancel` fires or the presence stream closes.
    pub async fn run(self, cancel: CancellationToken) {
        let mut presence_rx = self.presence.subscribe();
        let mut state = ReaperState::new(self.config.clone());
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            grace_secs = self.config.grace.as_secs(),
            stale_after_secs = self.config.stale_after.map(|d| d.as_secs()),
            "Lock reaper started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Lock reaper shutting down");
                    break;
                }
                changed = presence_rx.changed() => {
                    if changed.is_err() {
                        tracing::warn!("Presence stream closed, lock reaper stopping");
                        break;
                    }
                }
                _ = ticker.tick() => {}
            }

            let presence = Arc::clone(&presence_rx.borrow_and_update());
            self.evaluate(&mut state, &presence).await;
        }
    }

    /// One evaluation pass. Returns the number of clients reaped.
    pub async fn evaluate(&self, state: &mut ReaperState, presence: &PresenceMap) -> usize {
        let holders = self.lock_holders();
        let now = Instant::now();
        let due = state.observe(presence, &holders, Utc::now(), now);
        let overdue = now.checked_sub(self.config.grace).unwrap_or(now);

        let mut reaped = 0;
        for client_id in due {
            let release = async {
                self.locks
                    .release_all(&client_id)
                    .await
                    .map_err(CollabError::from)
            };
            match with_timeout(
                "reaper.release_all",
                self.config.release_timeout,
                self.events.as_deref(),
                release,
            )
            .await
            {
                Ok(summary) if summary.is_complete() => {
                    tracing::info!(
                        client_id = %client_id,
                        released = summary.released.len(),
                        "Reaped locks of absent client",
                    );
                    self.stats.clients_reaped.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .locks_released
                        .fetch_add(summary.released.len() as u64, Ordering::Relaxed);
                    if let Some(bus) = &self.events {
                        bus.publish(CanvasEvent::OwnerReaped {
                            owner: client_id.clone(),
                            released: summary.released,
                        });
                    }
                    reaped += 1;
                }
                Ok(summary) => {
                    tracing::warn!(
                        client_id = %client_id,
                        released = summary.released.len(),
                        failed = summary.failed.len(),
                        "Partial reap, will retry",
                    );
                    self.stats
                        .locks_released
                        .fetch_add(summary.released.len() as u64, Ordering::Relaxed);
                    self.stats.failed_reaps.fetch_add(1, Ordering::Relaxed);
                    state.reap_failed(&client_id, overdue);
                }
                Err(e) => {
                    tracing::warn!(client_id = %client_id, error = %e, "Reap failed, will retry");
                    self.stats.failed_reaps.fetch_add(1, Ordering::Relaxed);
                    state.reap_failed(&client_id, overdue);
                }
            }
        }
        reaped
    }

    fn lock_holders(&self) -> BTreeSet<OwnerId> {
        self.snapshots
            .borrow()
            .shapes
            .iter()
            .filter(|shape| shape.is_locked)
            .filter_map(|shape| shape.locked_by.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
