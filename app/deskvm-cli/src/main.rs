//! deskvm CLI - manage GUI test VMs from the shell.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log-level.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match &cli.command {
        Commands::Purge(args) => commands::vm::purge(&cli, args),
        Commands::Prepare(args) => commands::vm::prepare(&cli, args),
        Commands::Snapshots(args) => commands::vm::snapshots(&cli, args),
        Commands::Tree(args) => commands::tree::execute(&cli, args),
    }
}
