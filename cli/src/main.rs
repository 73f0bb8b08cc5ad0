// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Cohort DLM Node CLI
//!
//! The `cohortctl` binary runs a lock manager node and inspects its
//! configuration.
//!
//! ## Commands
//!
//! - `cohortctl serve` - Run a node until SIGINT/SIGTERM
//! - `cohortctl simulate` - Drive contending clients against an in-process node
//! - `cohortctl config show|validate|generate` - Configuration management

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use cohort_dlm::commands::{self, ConfigCommand, ServeArgs, SimulateArgs};
use cohort_dlm::init_logging;

/// Cohort DLM - cluster-wide lock manager node
#[derive(Parser)]
#[command(name = "cohortctl")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "COHORT_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "COHORT_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a lock manager node
    #[command(name = "serve")]
    Serve(ServeArgs),

    /// Run a contention scenario against an in-process node
    #[command(name = "simulate")]
    Simulate(SimulateArgs),

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    match cli.command {
        Some(Commands::Serve(args)) => commands::serve::run(args, cli.config).await,
        Some(Commands::Simulate(args)) => commands::simulate::run(args).await,
        Some(Commands::Config { command }) => {
            commands::config::handle_command(command, cli.config).await
        }
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}
