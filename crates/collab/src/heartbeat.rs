//! Periodic presence renewal for a connected client.

use std::sync::Arc;
use std::time::Duration;

use canvas_core::collaboration::HEARTBEAT_INTERVAL_SECS;
use canvas_core::presence::{Cursor, PresenceRecord};
use canvas_core::types::{OwnerId, ShapeId};
use canvas_store::PresenceChannel;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// What the client is doing right now, published with every heartbeat.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Activity {
    pub cursor: Option<Cursor>,
    pub editing: Option<ShapeId>,
}

/// Handle to a running heartbeat task.
///
/// The task announces the client on start and every interval, and departs
/// when cancelled. Activity updates are picked up on the next beat.
pub struct Heartbeat {
    activity: watch::Sender<Activity>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Heartbeat {
    pub fn spawn(
        presence: Arc<dyn PresenceChannel>,
        client_id: OwnerId,
        display_name: String,
        interval: Duration,
    ) -> Self {
        let (activity, activity_rx) = watch::channel(Activity::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            presence,
            client_id,
            display_name,
            interval,
            activity_rx,
            cancel.clone(),
        ));
        Self {
            activity,
            cancel,
            task,
        }
    }

    /// Spawn with the default interval.
    pub fn spawn_default(
        presence: Arc<dyn PresenceChannel>,
        client_id: OwnerId,
        display_name: String,
    ) -> Self {
        Self::spawn(
            presence,
            client_id,
            display_name,
            Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
        )
    }

    pub fn set_activity(&self, activity: Activity) {
        self.activity.send_replace(activity);
    }

    /// Stop beating and depart from the channel.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Heartbeat task ended abnormally");
        }
    }
}

async fn run(
    presence: Arc<dyn PresenceChannel>,
    client_id: OwnerId,
    display_name: String,
    interval: Duration,
    activity: watch::Receiver<Activity>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let current = activity.borrow().clone();
                let mut record = PresenceRecord::online(client_id.clone(), display_name.clone());
                record.cursor = current.cursor;
                record.currently_editing = current.editing;
                if let Err(e) = presence.announce(record).await {
                    tracing::warn!(client_id = %client_id, error = %e, "Heartbeat failed");
                }
            }
        }
    }

    if let Err(e) = presence.depart(&client_id).await {
        tracing::warn!(client_id = %client_id, error = %e, "Failed to depart presence channel");
    }
    tracing::debug!(client_id = %client_id, "Heartbeat stopped");
}
