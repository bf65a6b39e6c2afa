use std::time::Duration;

use canvas_core::collaboration::{
    self, MAX_BATCH_SIZE, MAX_HISTORY_DEPTH, PRESENCE_STALE_SECS, REAPER_GRACE_SECS,
    REAPER_POLL_MS,
};
use canvas_core::retry::RetryPolicy;

/// Client-side collaboration settings.
///
/// Defaults come from [`canvas_core::collaboration`]; [`CollabConfig::from_env`]
/// lets deployments override them.
#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// Lifetime of an optimistic overlay entry.
    pub overlay_ttl: Duration,
    /// Trailing debounce window of the batched creation pipeline.
    pub batch_debounce: Duration,
    /// Upper bound on how long the first pending creation waits.
    pub batch_max_wait: Duration,
    /// Pending creations that force an immediate flush.
    pub max_batch_size: usize,
    /// Timeout for single-shape actions.
    pub single_timeout: Duration,
    /// Timeout for bulk actions.
    pub bulk_timeout: Duration,
    /// Maximum undo depth.
    pub history_depth: usize,
    /// Backoff applied to transient store failures.
    pub retry: RetryPolicy,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            overlay_ttl: collaboration::overlay_ttl(),
            batch_debounce: collaboration::batch_debounce(),
            batch_max_wait: collaboration::batch_max_wait(),
            max_batch_size: MAX_BATCH_SIZE,
            single_timeout: collaboration::single_action_timeout(),
            bulk_timeout: collaboration::bulk_action_timeout(),
            history_depth: MAX_HISTORY_DEPTH,
            retry: RetryPolicy::default(),
        }
    }
}

impl CollabConfig {
    /// Load overrides from environment variables.
    ///
    /// | Env Var                      | Default |
    /// |------------------------------|---------|
    /// | `CANVAS_OVERLAY_TTL_MS`      | `2000`  |
    /// | `CANVAS_BATCH_DEBOUNCE_MS`   | `50`    |
    /// | `CANVAS_BATCH_MAX_WAIT_MS`   | `250`   |
    /// | `CANVAS_MAX_BATCH_SIZE`      | `500`   |
    /// | `CANVAS_SINGLE_TIMEOUT_MS`   | `3000`  |
    /// | `CANVAS_BULK_TIMEOUT_MS`     | `10000` |
    /// | `CANVAS_HISTORY_DEPTH`       | `100`   |
    /// | `CANVAS_RETRY_MAX_ATTEMPTS`  | `4`     |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            overlay_ttl: env_millis("CANVAS_OVERLAY_TTL_MS", defaults.overlay_ttl),
            batch_debounce: env_millis("CANVAS_BATCH_DEBOUNCE_MS", defaults.batch_debounce),
            batch_max_wait: env_millis("CANVAS_BATCH_MAX_WAIT_MS", defaults.batch_max_wait),
            max_batch_size: env_parse("CANVAS_MAX_BATCH_SIZE", defaults.max_batch_size),
            single_timeout: env_millis("CANVAS_SINGLE_TIMEOUT_MS", defaults.single_timeout),
            bulk_timeout: env_millis("CANVAS_BULK_TIMEOUT_MS", defaults.bulk_timeout),
            history_depth: env_parse("CANVAS_HISTORY_DEPTH", defaults.history_depth),
            retry: RetryPolicy {
                max_attempts: env_parse("CANVAS_RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts),
                ..defaults.retry
            },
        }
    }
}

/// Lock reaper settings.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// How long a client must stay absent before its locks are released.
    pub grace: Duration,
    /// Records whose `last_seen` is older than this count as absent.
    /// `None` relies on record removal alone.
    pub stale_after: Option<Duration>,
    /// Re-evaluation interval when no presence change arrives.
    pub poll_interval: Duration,
    /// Also track lock holders that never showed up in the presence channel.
    pub sweep_orphans: bool,
    /// Timeout applied to releasing one client's locks.
    pub release_timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(REAPER_GRACE_SECS),
            stale_after: Some(Duration::from_secs(PRESENCE_STALE_SECS)),
            poll_interval: Duration::from_millis(REAPER_POLL_MS),
            sweep_orphans: true,
            release_timeout: collaboration::bulk_action_timeout(),
        }
    }
}

impl ReaperConfig {
    /// Load overrides from environment variables.
    ///
    /// | Env Var               | Default |
    /// |-----------------------|---------|
    /// | `REAPER_GRACE_SECS`   | `5`     |
    /// | `PRESENCE_STALE_SECS` | `15` (`0` disables staleness) |
    /// | `REAPER_POLL_MS`      | `1000`  |
    /// | `REAPER_SWEEP_ORPHANS`| `true`  |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let stale_secs: u64 = env_parse(
            "PRESENCE_STALE_SECS",
            defaults.stale_after.map_or(0, |d| d.as_secs()),
        );
        Self {
            grace: Duration::from_secs(env_parse("REAPER_GRACE_SECS", defaults.grace.as_secs())),
            stale_after: (stale_secs > 0).then(|| Duration::from_secs(stale_secs)),
            poll_interval: env_millis("REAPER_POLL_MS", defaults.poll_interval),
            sweep_orphans: env_parse("REAPER_SWEEP_ORPHANS", defaults.sweep_orphans),
            release_timeout: defaults.release_timeout,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(var = name, value = %raw, "Ignoring unparsable setting");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_millis(name: &str, default: Duration) -> Duration {
    Duration::from_millis(env_parse(name, default.as_millis() as u64))
}
