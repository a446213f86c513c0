//! Tether CLI - browse and move files on a tethered host
//!
//! Tether talks to a host-side agent over a direct USB link, an ADB
//! forwarded tunnel, or a loopback simulation.
//!
//! ## Quick Start
//!
//! ```bash
//! # List a directory on the host
//! tether ls /home
//!
//! # Fetch a file
//! tether get /home/report.pdf ./report.pdf
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]

use anyhow::Result;
use clap::Parser;

mod commands;
pub mod ui;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let global = cli.global;
    init_logging(global.verbose);

    match cli.command {
        Command::Ls(args) => commands::browse::ls(&global, args).await,
        Command::Find(args) => commands::browse::find(&global, args).await,
        Command::Stat(args) => commands::browse::stat(&global, args).await,
        Command::Df(args) => commands::browse::df(&global, args).await,
        Command::Drives => commands::browse::drives(&global).await,
        Command::Mkdir(args) => commands::manage::mkdir(&global, args).await,
        Command::Mv(args) => commands::manage::mv(&global, args).await,
        Command::Rm(args) => commands::manage::rm(&global, args).await,
        Command::Get(args) => commands::transfer::get(&global, args).await,
        Command::Put(args) => commands::transfer::put(&global, args).await,
        Command::History(args) => commands::transfer::history(&global, args).await,
    }
}

/// Log to stderr; `RUST_LOG` wins over `--verbose`.
fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = if verbose {
        "info,tether=debug,tether_core=debug"
    } else {
        "warn,tether=info,tether_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false).without_time())
        .with(filter)
        .init();
}
