//! Command line interface definition.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Shardgate: a replicating S3 reverse proxy.
#[derive(Parser)]
#[command(name = "shardgate")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Start the proxy.
    Serve(ServeArgs),
    /// Load and validate a configuration file, then exit.
    CheckConfig(CheckConfigArgs),
    /// Print version information.
    Version,
}

/// Arguments for the serve command.
#[derive(Args)]
pub struct ServeArgs {
    /// Path to configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Bind address (overrides config).
    #[arg(short, long)]
    pub bind: Option<SocketAddr>,

    /// Ledger file (overrides config).
    #[arg(long)]
    pub ledger: Option<PathBuf>,

    /// Disable the consistency ledger and the repair pipeline.
    #[arg(long)]
    pub no_watchdog: bool,
}

/// Arguments for the check-config command.
#[derive(Args)]
pub struct CheckConfigArgs {
    /// Path to configuration file.
    pub config: PathBuf,
}
