//! Command-line interface for triptrack.
//!
//! This module provides the CLI structure for the `triptrack` binary and the
//! frame printer used by `triptrack track`.

mod commands;

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::warn;

use crate::logging::Verbosity;
use crate::map::MapFrame;
use crate::tracker::FrameSink;

pub use commands::{ConfigCommand, OutputFormat, PositionCommand, TrackCommand};

/// triptrack - Share your position with fellow travelers
///
/// Publishes your live position into a trip room and shows where everyone
/// else on the trip is.
#[derive(Debug, Parser)]
#[command(name = "triptrack")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Track a trip live until interrupted
    Track(TrackCommand),

    /// Print a single position fix
    Position(PositionCommand),

    /// View or check configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_flags(self.quiet, self.verbose)
    }
}

/// Writes map frames to an output stream.
#[derive(Debug)]
pub struct FramePrinter<W> {
    out: W,
    format: OutputFormat,
}

impl<W: Write> FramePrinter<W> {
    /// Create a printer writing `format` to `out`.
    pub fn new(out: W, format: OutputFormat) -> Self {
        Self { out, format }
    }
}

impl<W: Write + Send + std::fmt::Debug> FrameSink for FramePrinter<W> {
    fn show(&mut self, frame: &MapFrame) {
        let rendered = match self.format {
            OutputFormat::Plain => Ok(frame.to_text()),
            OutputFormat::Json => frame.to_json().map(|line| line + "\n"),
        };
        let result = match rendered {
            Ok(text) => self
                .out
                .write_all(text.as_bytes())
                .and_then(|()| self.out.flush()),
            Err(e) => {
                warn!(error = %e, "Failed to encode map frame");
                return;
            }
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to write map frame");
        }
    }
}
