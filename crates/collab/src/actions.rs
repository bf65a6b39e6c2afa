//! Timeout wrapping for externally triggered actions.
//!
//! Every action a human or an agent issues runs under a deadline: short for
//! single-shape operations, longer for bulk ones. An elapsed deadline is a
//! definitive failure of that one action and never blocks others.

use std::future::Future;
use std::time::Duration;

use canvas_events::{CanvasEvent, EventBus};

use crate::config::CollabConfig;
use crate::error::{CollabError, CollabResult};

/// Which deadline an action runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionScope {
    Single,
    Bulk,
}

impl ActionScope {
    pub fn limit(self, config: &CollabConfig) -> Duration {
        match self {
            ActionScope::Single => config.single_timeout,
            ActionScope::Bulk => config.bulk_timeout,
        }
    }
}

/// Run `fut` under `limit`, converting an elapsed deadline into
/// [`CollabError::Timeout`].
pub async fn with_timeout<T, F>(
    operation: &'static str,
    limit: Duration,
    events: Option<&EventBus>,
    fut: F,
) -> CollabResult<T>
where
    F: Future<Output = CollabResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation, after_ms = limit.as_millis() as u64, "Action timed out");
            if let Some(bus) = events {
                bus.publish(CanvasEvent::ActionTimedOut {
                    operation: operation.to_string(),
                    after_ms: limit.as_millis() as u64,
                });
            }
            Err(CollabError::Timeout {
                operation,
                after: limit,
            })
        }
    }
}
