//! CLI command definitions and handlers.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod config;
pub mod loopback;

/// Load configuration with graceful fallback to defaults.
///
/// A missing or unreadable config file is reported and replaced by defaults.
pub fn load_config() -> pipedrop_core::config::Config {
    pipedrop_core::config::Config::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Using default configuration");
        pipedrop_core::config::Config::default()
    })
}

/// Pipedrop - chunked, resumable peer-to-peer file transfer
#[derive(Parser)]
#[command(name = "pipedrop")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Detailed logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Transfer files through an in-process sender/receiver pair
    Loopback(LoopbackArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for the loopback command
#[derive(Parser)]
pub struct LoopbackArgs {
    /// Files and folders to transfer
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Directory received files are written to
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Keep received files in memory instead of writing them
    #[arg(long)]
    pub memory: bool,

    /// Also send a text message
    #[arg(short, long)]
    pub text: Option<String>,

    /// Drop the link after this many chunks (leaves partial files to resume)
    #[arg(long)]
    pub stop_after: Option<u64>,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for the config command
#[derive(Parser)]
pub struct ConfigArgs {
    /// Config action
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config actions
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show all configuration values
    Show,

    /// Print the configuration file location
    Path,

    /// Get a configuration value
    Get {
        /// Configuration key, e.g. `transfer.chunk_size`
        key: String,
    },

    /// Set a configuration value
    Set {
        /// Configuration key, e.g. `transfer.chunk_size`
        key: String,
        /// New value
        value: String,
    },

    /// Reset configuration to defaults
    Reset,
}
