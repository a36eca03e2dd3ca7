//! Process-wide interrupt flag.
//!
//! Event loops check [`interrupted`] once per iteration and exit cleanly.
//! The flag is one-way: once set it stays set for the life of the process.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// True once a shutdown signal has been received.
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Request shutdown programmatically, as a signal would.
pub fn trip() {
    INTERRUPTED.store(true, Ordering::Relaxed);
}

/// Spawn a task that trips the flag on SIGINT or SIGTERM. Call once from
/// `main`, inside a runtime.
pub fn install_signal_handlers() {
    tokio::spawn(async {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
            }
            _ = terminate() => {
                info!("received SIGTERM, shutting down");
            }
        }
        trip();
    });
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to set up SIGTERM handler");
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
