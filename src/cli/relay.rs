//! `topomap relay`: serve sessions until Ctrl+C.

use anyhow::{Context, Result};

use crate::cli::shutdown::{shutdown_signal, wait_for_shutdown};
use crate::config::TopomapConfig;
use crate::sync::relay::Relay;

pub async fn run_relay(config: &TopomapConfig) -> Result<()> {
    let signal = shutdown_signal();
    let mut relay = Relay::start(&config.relay.interface.to_string(), config.relay.port)?;

    wait_for_shutdown(signal).await;

    tokio::task::spawn_blocking(move || relay.stop())
        .await
        .context("relay shutdown failed")
}
