//! AirLink CLI - LAN file relay with live transfer progress
//!
//! Devices on the same network open the relay in a browser, pick a peer and
//! send it a file. The relay buffers the upload and streams it to the
//! receiver, who can pause, resume or cancel the download.
//!
//! ## Quick Start
//!
//! ```bash
//! # Start the relay on port 8080
//! airlink serve
//!
//! # Custom port, URL advertised under a fixed address
//! airlink serve --port 9000 --host 192.168.1.20
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

use anyhow::Result;
use clap::Parser;

mod commands;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match cli.command {
        Command::Serve(args) => commands::serve::run(args, cli.config.as_deref()).await,
        Command::Config(args) => commands::config::run(args, cli.config.as_deref()),
        Command::Completions(args) => {
            commands::completions::run(args.shell);
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = if verbose {
        "info,airlink=debug,airlink_core=debug,tower_http=debug"
    } else {
        "warn,airlink=info,airlink_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}
