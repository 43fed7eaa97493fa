//! Command-line interface definitions.

use clap::{ColorChoice, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

/// Topomap collaborative map editor core
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None, arg_required_else_help = true)]
pub struct Cli {
    /// Control colored output (auto, always, never)
    #[arg(long, global = true, default_value = "auto")]
    pub color: ColorChoice,

    /// Show debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Config file path (default: topomap.toml)
    #[arg(short = 'C', long, default_value = "topomap.toml", value_hint = clap::ValueHint::FilePath)]
    pub config: PathBuf,

    /// subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Print the full map style for a JSON scene
    #[command(visible_alias = "s")]
    Style {
        /// Scene file: catalog plus layer list
        #[arg(value_hint = clap::ValueHint::FilePath)]
        scene: PathBuf,
    },

    /// Join a session as a headless replica
    #[command(visible_alias = "j")]
    Join {
        /// Session id
        session: String,

        /// Relay base URL (overrides sync.server)
        #[arg(long)]
        server: Option<String>,

        /// Do not read or write the local cache
        #[arg(long)]
        no_cache: bool,

        /// Scene file providing the style catalog and initial layers
        #[arg(long, value_hint = clap::ValueHint::FilePath)]
        scene: Option<PathBuf>,
    },

    /// Run a session relay server
    #[command(visible_alias = "r")]
    Relay {
        /// Network interface to bind (e.g., 127.0.0.1, 0.0.0.0)
        #[arg(short, long)]
        interface: Option<IpAddr>,

        /// Port number to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
}
