use std::time::Duration;

use anyhow::Context;
use canvas_collab::ReaperConfig;

/// Daemon configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    /// Bind address for the health endpoint (default: `0.0.0.0`).
    pub host: String,
    /// Bind port for the health endpoint (default: `3100`).
    pub port: u16,
    /// How often the presence table is polled for changes.
    pub presence_poll: Duration,
    /// Upper bound on waiting for background tasks at shutdown.
    pub shutdown_timeout: Duration,
    pub reaper: ReaperConfig,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                 | Default    |
    /// |-------------------------|------------|
    /// | `DATABASE_URL`          | (required) |
    /// | `HOST`                  | `0.0.0.0`  |
    /// | `PORT`                  | `3100`     |
    /// | `PRESENCE_POLL_MS`      | `1000`     |
    /// | `SHUTDOWN_TIMEOUT_SECS` | `5`        |
    ///
    /// Reaper settings are read by [`ReaperConfig::from_env`].
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());

        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "3100".into())
            .parse()
            .context("PORT must be a valid u16")?;

        let presence_poll_ms: u64 = std::env::var("PRESENCE_POLL_MS")
            .unwrap_or_else(|_| "1000".into())
            .parse()
            .context("PRESENCE_POLL_MS must be a valid u64")?;

        let shutdown_timeout_secs: u64 = std::env::var("SHUTDOWN_TIMEOUT_SECS")
            .unwrap_or_else(|_| "5".into())
            .parse()
            .context("SHUTDOWN_TIMEOUT_SECS must be a valid u64")?;

        Ok(Self {
            database_url,
            host,
            port,
            presence_poll: Duration::from_millis(presence_poll_ms.max(1)),
            shutdown_timeout: Duration::from_secs(shutdown_timeout_secs),
            reaper: ReaperConfig::from_env(),
        })
    }
}
