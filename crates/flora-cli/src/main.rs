//! Flower Care command-line interface.

mod cli;
mod commands;
mod config;
mod format;
mod repository;
mod style;

use std::io;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::commands::Context;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle completions command early (before tracing init)
    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "flora", &mut io::stdout());
        return Ok(());
    }

    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;
    let checkpoint_dir = config.checkpoint_dir(cli.checkpoint_dir.clone());
    tracing::debug!("checkpoints in {}", checkpoint_dir.display());

    let ctx = Context {
        config,
        config_path,
        checkpoint_dir,
        format: cli.format,
        quiet: cli.quiet,
    };

    match cli.command {
        Commands::Scan { timeout, all } => commands::cmd_scan(&ctx, timeout, all).await,
        Commands::Live {
            device,
            count,
            interval,
        } => commands::cmd_live(&ctx, &device, count, interval).await,
        Commands::History { device, output } => {
            commands::cmd_history(&ctx, &device, output).await
        }
        Commands::Blink { device } => commands::cmd_blink(&ctx, &device).await,
        Commands::Config { init } => commands::cmd_config(&ctx, init),
        Commands::Completions { .. } => Ok(()),
    }
}
