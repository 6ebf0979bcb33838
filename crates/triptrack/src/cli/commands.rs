//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand, ValueEnum};

/// Track command arguments.
#[derive(Debug, Args)]
pub struct TrackCommand {
    /// Trip to track (defaults to `trip.trip_id` from the config)
    #[arg(short, long)]
    pub trip: Option<String>,

    /// Local user id (defaults to `trip.user_id` from the config)
    #[arg(short, long)]
    pub user: Option<String>,

    /// Auth token for the realtime server
    #[arg(long, env = "TRIPTRACK_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Replay a recorded track instead of using gpsd
    #[arg(short, long, value_name = "FILE")]
    pub replay: Option<PathBuf>,

    /// Output format for map frames
    #[arg(short, long, value_enum, default_value = "plain")]
    pub format: OutputFormat,
}

/// Position command arguments.
#[derive(Debug, Args)]
pub struct PositionCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

/// Output format for commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Plain text output
    #[default]
    Plain,
    /// One JSON object per line
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format_default() {
        assert_eq!(OutputFormat::default(), OutputFormat::Plain);
    }

    #[test]
    fn test_track_command_debug() {
        let cmd = TrackCommand {
            trip: Some("t1".to_string()),
            user: Some("u1".to_string()),
            token: Some("secret".to_string()),
            replay: None,
            format: OutputFormat::Json,
        };
        let debug_str = format!("{cmd:?}");
        assert!(debug_str.contains("trip"));
        assert!(debug_str.contains("Json"));
    }

    #[test]
    fn test_config_command_debug() {
        let cmd = ConfigCommand::Show { json: false };
        let debug_str = format!("{cmd:?}");
        assert!(debug_str.contains("Show"));
    }
}
