use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use canvas_collab::{CollabConfig, LockManager, LockReaper};
use canvas_db::{PgPresence, PgShapeStore};
use canvas_events::EventBus;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use canvas_worker::config::WorkerConfig;
use canvas_worker::health::{self, HealthState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "canvas_worker=debug,canvas_collab=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = WorkerConfig::from_env()?;
    let collab = CollabConfig::from_env();
    tracing::info!(
        host = %config.host,
        port = config.port,
        grace_secs = config.reaper.grace.as_secs(),
        "Loaded worker configuration",
    );

    // --- Database ---
    let pool = canvas_db::create_pool(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    canvas_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    canvas_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database ready");

    // --- Adapters ---
    let store = Arc::new(
        PgShapeStore::connect(pool.clone())
            .await
            .context("Failed to load shapes")?,
    );
    let presence = Arc::new(
        PgPresence::connect(pool.clone(), config.presence_poll)
            .await
            .context("Failed to load presence")?,
    );

    // --- Event bus ---
    let event_bus = Arc::new(EventBus::default());
    let mut events = event_bus.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(envelope) => tracing::info!(event = ?envelope.event, "Canvas event"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event log lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // --- Reaper ---
    let locks = Arc::new(
        LockManager::new(store.clone(), collab.retry.clone()).with_events(Arc::clone(&event_bus)),
    );
    let reaper = LockReaper::new(store.clone(), locks, presence, config.reaper.clone())
        .with_events(Arc::clone(&event_bus));
    let stats = reaper.stats();
    let cancel = CancellationToken::new();
    let reaper_handle = tokio::spawn(reaper.run(cancel.clone()));

    // --- Router ---
    let app = health::router(HealthState { pool, stats }).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().context("Invalid HOST address")?,
        config.port,
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    tracing::info!(%addr, "Health endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Stopping lock reaper");
    cancel.cancel();
    let _ = tokio::time::timeout(config.shutdown_timeout, reaper_handle).await;

    drop(event_bus);
    drop(store);
    let _ = tokio::time::timeout(config.shutdown_timeout, event_log).await;

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
