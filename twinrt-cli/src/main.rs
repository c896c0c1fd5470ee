//! # twinrt CLI
//!
//! Command-line interface for the twinrt digital-twin runtime.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "twinrt")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a runtime configuration file
    #[arg(long, env = "TWINRT_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a scenario file and print the resulting entity state
    Replay {
        /// Scenario file (YAML)
        scenario: PathBuf,

        /// Override the scenario's settle time in milliseconds
        #[arg(long)]
        settle_ms: Option<u64>,

        /// Emit compact JSON instead of pretty-printed
        #[arg(long)]
        compact: bool,
    },

    /// Print the effective runtime configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays machine-readable
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(if cli.verbose {
                tracing::Level::DEBUG.into()
            } else {
                tracing::Level::WARN.into()
            }),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Replay {
            scenario,
            settle_ms,
            compact,
        } => {
            let opts = commands::ReplayOptions { settle_ms, compact };
            commands::replay_scenario(&scenario, config, opts).await
        }
        Commands::Config => commands::show_config(&config),
    }
}
