//! `triptrack` - CLI for live trip-position tracking
//!
//! This binary tracks a trip in the foreground, prints one-shot fixes and
//! inspects configuration.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{debug, info};

use triptrack::cli::{Cli, Command, ConfigCommand, FramePrinter, PositionCommand, TrackCommand};
use triptrack::location::{LocationProvider, ReplayProvider};
use triptrack::notice::ConsoleReporter;
use triptrack::{
    init_logging, Config, Notice, NoticeReporter, PositionSource, RealtimeChannel,
    TrackerOptions, TrackerState, TripTracker,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // Validating a file must not fail on the default config
    if let Command::Config(ConfigCommand::Validate { file }) = &cli.command {
        let path = file
            .clone()
            .or_else(|| cli.config.clone())
            .unwrap_or_else(Config::default_config_path);
        return handle_validate(&path);
    }

    let config = Config::load_from(cli.config.clone()).context("loading configuration")?;

    match cli.command {
        Command::Track(cmd) => handle_track(&config, cmd).await,
        Command::Position(cmd) => handle_position(&config, &cmd).await,
        Command::Config(cmd) => handle_config(&config, &cmd),
    }
}

async fn handle_track(config: &Config, cmd: TrackCommand) -> anyhow::Result<()> {
    let reporter = Arc::new(ConsoleReporter);

    let (trip_id, user_id) = match config.trip_identity(cmd.trip.as_deref(), cmd.user.as_deref())
    {
        Ok(ids) => ids,
        Err(e) => {
            reporter.report(Notice::invalid_trip());
            return Err(e).context("resolving trip and user");
        }
    };

    let provider: Arc<dyn LocationProvider> = match cmd.replay {
        Some(path) => Arc::new(ReplayProvider::new(path, config.replay_step())),
        None => config.location_provider()?,
    };
    debug!(provider = provider.name(), "Location provider selected");

    let mut options = TrackerOptions::from_config(config, trip_id, user_id);
    if let Some(token) = cmd.token {
        options.auth_token = token;
    }

    let mut tracker = TripTracker::new(
        options,
        PositionSource::new(provider, config.watch_options()),
        RealtimeChannel::new(config.channel_config()),
        reporter,
    );

    let state = tracker.start().await;
    if state == TrackerState::Denied {
        tracker.teardown().await;
        bail!("location permission denied");
    }

    info!(state = %state, "Tracking; press Ctrl-C to stop");
    let mut printer = FramePrinter::new(std::io::stdout(), cmd.format);
    tracker
        .run(&mut printer, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    tracker.teardown().await;
    Ok(())
}

async fn handle_position(config: &Config, cmd: &PositionCommand) -> anyhow::Result<()> {
    let source = PositionSource::new(config.location_provider()?, config.watch_options());

    let fix = match source.locate().await {
        Ok(fix) => fix,
        Err(e) => {
            let notice = if e.is_permission_error() {
                Notice::permission_denied()
            } else {
                Notice::acquisition_failed()
            };
            ConsoleReporter.report(notice);
            return Err(e).context("acquiring position");
        }
    };

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&fix)?);
    } else {
        println!("Provider:   {}", source.provider_name());
        println!("Latitude:   {:.6}", fix.latitude);
        println!("Longitude:  {:.6}", fix.longitude);
        println!("Time:       {}", fix.timestamp.to_rfc3339());
    }
    Ok(())
}

fn handle_validate(path: &std::path::Path) -> anyhow::Result<()> {
    println!("Validating configuration: {}", path.display());
    match Config::load_from(Some(path.to_path_buf())) {
        Ok(_) => {
            println!("Configuration is valid.");
            Ok(())
        }
        Err(e) => bail!("configuration error: {e}"),
    }
}

fn handle_config(config: &Config, cmd: &ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if *json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                print_config(config);
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.clone().unwrap_or_else(Config::default_config_path);
            return handle_validate(&path);
        }
    }
    Ok(())
}

fn print_config(config: &Config) {
    let or_unset = |value: &Option<String>| value.clone().unwrap_or_else(|| "(unset)".to_string());

    println!("Current Configuration");
    println!("=====================");
    println!();
    println!("[Channel]");
    println!("  Server URL:         {}", config.channel.server_url);
    println!(
        "  Auth token:         {}",
        if config.channel.auth_token.is_empty() { "(none)" } else { "(set)" }
    );
    println!("  Connect timeout:    {}s", config.channel.connect_timeout_secs);
    println!();
    println!("[Location]");
    println!("  Provider:           {:?}", config.location.provider);
    println!("  gpsd address:       {}", config.location.gpsd_address);
    if let Some(file) = &config.location.replay_file {
        println!("  Replay file:        {}", file.display());
    }
    println!("  Time interval:      {}ms", config.location.time_interval_ms);
    println!("  Distance interval:  {}m", config.location.distance_interval_m);
    println!();
    println!("[Registry]");
    println!("  Ordering:           {}", config.registry.ordering);
    match config.stale_after() {
        Some(age) => println!("  Stale after:        {}s", age.as_secs()),
        None => println!("  Stale after:        never"),
    }
    println!();
    println!("[Map]");
    println!(
        "  Initial region:     ({}, {})",
        config.map.initial_region.latitude, config.map.initial_region.longitude
    );
    println!("  Refresh interval:   {}ms", config.map.refresh_interval_ms);
    println!();
    println!("[Trip]");
    println!("  Trip:               {}", or_unset(&config.trip.trip_id));
    println!("  User:               {}", or_unset(&config.trip.user_id));
}
