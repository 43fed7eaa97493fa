//! Topomap - collaborative map feature-tree core.

// The state actions and in-memory doubles serve embedders and tests; the
// headless commands drive only part of them.
#![allow(dead_code)]

mod cli;
mod config;
mod feature;
mod json;
mod logger;
mod state;
mod style;
mod sync;

use anyhow::{Context, Result};
use clap::{ColorChoice, Parser};
use cli::{Cli, Commands};
use config::TopomapConfig;

fn main() -> Result<()> {
    // Setup global Ctrl+C handler (before any blocking operations)
    cli::shutdown::setup_shutdown_handler()?;

    let cli = Cli::parse();

    // Set global color override based on CLI option
    match cli.color {
        ColorChoice::Always => owo_colors::set_override(true),
        ColorChoice::Never => owo_colors::set_override(false),
        ColorChoice::Auto => {} // owo-colors auto-detects TTY
    }
    logger::set_verbose(cli.verbose);

    let config = TopomapConfig::load(&cli)?;
    if let Some(path) = &config.config_path {
        debug!("config"; "loaded {}", path.display());
    }

    match &cli.command {
        Commands::Style { scene } => cli::style::print_style(scene),
        Commands::Join { session, scene, .. } => {
            runtime()?.block_on(cli::join::join_session(&config, session, scene.as_deref()))
        }
        Commands::Relay { .. } => runtime()?.block_on(cli::relay::run_relay(&config)),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}
