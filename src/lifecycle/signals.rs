//! OS signal handling.
//!
//! # Responsibilities
//! - Listen for SIGINT and SIGTERM
//! - Turn the first one into a graceful shutdown
//! - Exit the process on the second one
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - Config reload is driven by the file watcher, not SIGHUP

use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::shutdown::Shutdown;

/// Exit status when a second interrupt cuts draining short.
pub const FORCED_EXIT_CODE: i32 = 130;

/// Spawn the signal listener for the life of the process.
pub fn spawn_signal_handler(shutdown: Shutdown) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = interrupted().await {
            warn!(error = %e, "cannot listen for signals, relying on exit_after_secs");
            return;
        }
        info!("shutdown signal received, draining");
        shutdown.trigger();

        if interrupted().await.is_ok() {
            warn!("second shutdown signal, exiting without draining");
            std::process::exit(FORCED_EXIT_CODE);
        }
    })
}

#[cfg(unix)]
async fn interrupted() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn interrupted() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
