//! tracker-drain - drains a durable tracker queue into a collector
//!
//! Spawns a worker pool over the queue root and runs until every worker has
//! terminated after its empty polls, or until Ctrl+C/SIGTERM.
//!
//! ## Usage
//!
//! ```bash
//! TRACKER_COLLECTOR_HOST=collector.acme.au tracker-drain
//!
//! # Move quarantined files back into the inboxes, then drain
//! TRACKER_COLLECTOR_HOST=collector.acme.au tracker-drain --replay-quarantine
//! ```
//!
//! ## Environment Variables
//!
//! - `TRACKER_COLLECTOR_HOST`: collector host, optionally with port (required)
//! - `TRACKER_METHOD`: `GET` or `POST` (default: POST)
//! - `TRACKER_QUEUE_DIR`: queue root (default: "temp")
//! - `TRACKER_WORKER_COUNT`: workers to spawn (default: 2)
//! - `TRACKER_LOG_LEVEL`: log level (default: "info")
//! - `TRACKER_LOG_FORMAT`: `json` or `pretty` (default: pretty)

use snowplow_tracker::config::{Config, LogFormat};
use snowplow_tracker::emit::{QueueLayout, WorkerPool};
use snowplow_tracker::metrics::{self, Metrics};
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config);

    Metrics::init()?;

    info!(
        collector = %config.emitter.url(),
        queue = %config.queue.root.display(),
        workers = config.queue.worker_count,
        delivery = ?config.queue.delivery,
        "Starting tracker-drain"
    );

    if std::env::args().any(|arg| arg == "--replay-quarantine") {
        let layout = QueueLayout::new(&config.queue.root, config.queue.worker_count);
        let moved = layout.replay_quarantine().await?;
        info!(files = moved, "Quarantine replayed");
    }

    let pool = WorkerPool::spawn(&config.emitter, &config.queue).await?;
    let debug_log = std::sync::Arc::clone(pool.debug_log());
    let abort = pool.abort_handles();

    tokio::select! {
        exits = pool.join() => {
            let delivered: u64 = exits.iter().map(|e| e.files_delivered).sum();
            let quarantined: u64 = exits.iter().map(|e| e.files_quarantined).sum();
            info!(delivered, quarantined, "All workers terminated");
        }
        _ = shutdown_signal() => {
            for handle in abort {
                handle.abort();
            }
        }
    }

    if debug_log.is_enabled() {
        info!(results = debug_log.len(), "Debug request results captured");
    }
    debug!(metrics = %metrics::gather(), "Final metrics");

    info!("tracker-drain shutdown complete");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = ?e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
