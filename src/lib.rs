//! # can-telemetry-agent
//!
//! Edge telemetry agent: captures CAN-bus frames, batches them into
//! time/count-bounded windows, serializes each window to a columnar Parquet
//! file under a Hive-style partition path, and uploads files to an
//! S3-compatible object store with retry and offline buffering.
//!
//! ## Design Philosophy
//!
//! - **Cooperative shutdown** - one `CancellationToken` drives every
//!   long-running task; nothing blocks past a one-second cancellation
//!   latency.
//! - **Filesystem as source of truth** - the pending/archive directories are
//!   the only index of upload state; no in-memory bookkeeping survives a
//!   restart.
//! - **At-least-once delivery** - batch filenames are content-timestamped, so
//!   a duplicate upload after a crash is harmless.
//!
//! ## Quick Start
//!
//! ```no_run
//! use can_telemetry_agent::config::Config;
//! use can_telemetry_agent::supervisor::{Mode, Supervisor};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(Path::new("config.yaml"))?;
//!     let supervisor = Supervisor::new(config, Mode::Normal);
//!
//!     can_telemetry_agent::run_with_shutdown(supervisor).await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Time/count-bounded batching of frames into Hive-partitioned Parquet files.
pub mod batcher;
/// Command-line argument parsing.
pub mod cli;
/// Configuration loading, legacy-schema normalization, and defaults.
pub mod config;
/// Error types.
pub mod error;
/// The CAN frame value type and reader statistics.
pub mod frame;
/// Bounds the pending-upload directory by disk usage and file count.
pub mod offline_buffer;
/// CAN frame acquisition: real SocketCAN backend and synthetic simulator.
pub mod reader;
/// Retry logic with exponential backoff.
pub mod retry;
/// Main orchestration: run loop, background tasks, graceful shutdown.
pub mod supervisor;
/// Upload of batched files to a remote object store.
pub mod uploader;

pub use config::Config;
pub use error::{Error, Result};
pub use supervisor::{Mode, Supervisor};

/// Run `supervisor` until a termination signal arrives, then shut down
/// gracefully.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal
///   registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown(supervisor: Supervisor) -> Result<()> {
    let cancel = tokio_util::sync::CancellationToken::new();
    let signal_cancel = cancel.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        signal_cancel.cancel();
    });

    supervisor.run(cancel).await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("received SIGTERM signal");
            } else {
                tracing::error!("could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to listen for Ctrl+C signal");
        }
    }
}
