//! Pipedrop CLI - chunked, resumable peer-to-peer file transfer
//!
//! The CLI drives both ends of a Pipedrop session in one process, linked by an
//! in-memory channel. It is the quickest way to watch the protocol work:
//! announcements, paced chunk streaming, ordered disk writes and resume.
//!
//! ## Quick Start
//!
//! ```bash
//! # Copy files and folders into ./inbox through a loopback session
//! pipedrop loopback ./photos ./notes.txt --output ./inbox
//!
//! # Interrupt after 10 chunks, then run again to resume
//! pipedrop loopback ./big.iso --output ./inbox --stop-after 10
//! pipedrop loopback ./big.iso --output ./inbox
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]

use anyhow::Result;
use clap::Parser;

mod commands;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Loopback(args) => commands::loopback::run(args).await,
        Command::Config(args) => commands::config::run(args),
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = if verbose {
        "info,pipedrop=debug,pipedrop_core=debug"
    } else {
        "warn,pipedrop=info,pipedrop_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time().compact())
        .with(filter)
        .init();
}
