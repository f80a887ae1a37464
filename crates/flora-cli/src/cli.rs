//! CLI argument definitions using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Output format for commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    /// One JSON document per line
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "flora")]
#[command(author, version, about = "CLI for Flower Care soil sensors", long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Configuration file [default: ~/.config/flora/config.toml]
    #[arg(long, global = true, env = "FLORA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory for history checkpoints
    #[arg(long, global = true)]
    pub checkpoint_dir: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Reusable device connection arguments
#[derive(Debug, Clone, Args)]
pub struct DeviceArgs {
    /// Device address or alias, or use FLORA_DEVICE env var
    #[arg(env = "FLORA_DEVICE")]
    pub device: Option<String>,

    /// Time to wait for the device to become ready, in seconds
    #[arg(short = 'T', long, default_value = "60")]
    pub timeout: u64,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scan for nearby Flower Care devices
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "10")]
        timeout: u64,

        /// List every BLE device, not only Flower Care
        #[arg(long)]
        all: bool,
    },

    /// Read current sensor values
    Live {
        #[command(flatten)]
        device: DeviceArgs,

        /// Number of readings to take
        #[arg(short = 'n', long, default_value = "1")]
        count: u32,

        /// Seconds between readings
        #[arg(short, long, default_value = "10")]
        interval: u64,
    },

    /// Download stored history, resuming an interrupted download
    History {
        #[command(flatten)]
        device: DeviceArgs,

        /// Append readings as JSON lines to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Blink the LED to identify a device
    Blink {
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Show the effective configuration
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        init: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_history_with_globals() {
        let cli = Cli::try_parse_from([
            "flora",
            "history",
            "C4:7C:8D:6A:12:34",
            "--checkpoint-dir",
            "/tmp/ck",
            "-f",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        assert_eq!(cli.checkpoint_dir, Some(PathBuf::from("/tmp/ck")));
        match cli.command {
            Commands::History { device, output } => {
                assert_eq!(device.device.as_deref(), Some("C4:7C:8D:6A:12:34"));
                assert_eq!(device.timeout, 60);
                assert!(output.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["flora", "-v", "-q", "scan"]).is_err());
    }
}
