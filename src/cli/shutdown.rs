//! Ctrl+C handling.
//!
//! Long-running commands subscribe to the shutdown signal. When nothing is
//! subscribed yet the process exits right away, since there is nothing to
//! tear down.

use std::sync::LazyLock;

use tokio::sync::watch;

static SIGNAL: LazyLock<watch::Sender<bool>> = LazyLock::new(|| watch::channel(false).0);

/// Setup the global Ctrl+C handler. Call once at program start
pub fn setup_shutdown_handler() -> anyhow::Result<()> {
    ctrlc::set_handler(|| {
        if SIGNAL.receiver_count() == 0 {
            std::process::exit(0);
        }
        crate::log!("topomap"; "shutting down...");
        SIGNAL.send_replace(true);
    })
    .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {}", e))
}

/// Receiver that flips to `true` on Ctrl+C.
pub fn shutdown_signal() -> watch::Receiver<bool> {
    SIGNAL.subscribe()
}

/// Wait until Ctrl+C.
pub async fn wait_for_shutdown(mut signal: watch::Receiver<bool>) {
    let _ = signal.wait_for(|stop| *stop).await;
}
