//! streamload CLI - Command-line interface
//!
//! Feeds newline-delimited protocol messages from stdin through the
//! streamload engine into a built-in counting destination.

mod commands;
mod destination;
mod error;
mod runner;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use commands::run::RunArgs;

#[derive(Parser)]
#[command(name = "streamload")]
#[command(version = streamload::VERSION)]
#[command(about = "Write orchestration engine for data movement connectors", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load JSON lines from stdin into the built-in destination
    Run(RunArgs),

    /// Print the effective configuration
    Config {
        /// Configuration file (INI). Defaults to ./streamload.ini when present
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => commands::run::run(args).await,
        Commands::Config { config } => commands::config::run(config.as_deref()),
    };

    if let Err(e) = result {
        e.exit();
    }
}
