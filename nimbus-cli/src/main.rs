// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Nimbus CLI
//!
//! Command-line interface for the Nimbus local cloud emulator.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod api;
mod commands;
mod gateway;
mod metrics;

/// Nimbus - local cloud emulator for functions, queues and identities
#[derive(Parser)]
#[command(name = "nimbus")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "nimbus.yaml")]
    pub config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the emulator and serve until Ctrl+C
    Up,

    /// List deployed functions
    List,

    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        file: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose.
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Up => commands::up::execute(&cli.config).await,
        Commands::List => commands::list::execute(&cli.config).await,
        Commands::Validate { file } => commands::validate::execute(&file).await,
    }
}
