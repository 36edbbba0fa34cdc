//! Seedstream CLI - Command-line interface
//!
//! Provides command-line access to Seedstream functionality.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use seedstream_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "seedstream")]
#[command(about = "Stream media out of a swarm while it downloads")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,

    /// Console log level
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    /// Directory for a full-detail log of the run
    #[arg(long)]
    logs_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())?;

    commands::handle_command(cli.command).await
}
