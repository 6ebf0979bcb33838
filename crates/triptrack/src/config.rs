//! Configuration management for triptrack.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::channel::{socket_endpoint, ChannelConfig};
use crate::error::{Error, Result};
use crate::location::{
    GpsdProvider, LocationProvider, ReplayProvider, WatchOptions, DEFAULT_GPSD_ADDRESS,
};
use crate::map::Region;
use crate::notice::INVALID_TRIP;
use crate::position::{ParticipantId, Position, TripId};
use crate::registry::UpdateOrdering;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default config directory name.
const CONFIG_DIR_NAME: &str = "triptrack";

/// Environment variable prefix. Nested keys are separated by `__`, e.g.
/// `TRIPTRACK_CHANNEL__SERVER_URL`.
const ENV_PREFIX: &str = "TRIPTRACK_";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `TRIPTRACK_`)
/// 2. TOML config file at `~/.config/triptrack/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Realtime channel configuration.
    pub channel: ChannelSettings,
    /// Location configuration.
    pub location: LocationConfig,
    /// Marker registry configuration.
    pub registry: RegistryConfig,
    /// Map configuration.
    pub map: MapConfig,
    /// Default trip and user.
    pub trip: TripConfig,
}

/// Realtime server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    /// Server base URL.
    pub server_url: String,
    /// Token sent with the socket.io connect packet. Empty for none.
    pub auth_token: String,
    /// Connect handshake timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Per-subscriber broadcast buffer.
    pub broadcast_capacity: usize,
}

/// Which location provider to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// A local gpsd daemon.
    #[default]
    Gpsd,
    /// A recorded track file.
    Replay,
}

/// Location-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// Provider to use.
    pub provider: ProviderKind,
    /// gpsd address (`host:port`).
    pub gpsd_address: String,
    /// Track file for the replay provider.
    pub replay_file: Option<PathBuf>,
    /// Interval between replayed fixes in milliseconds.
    pub replay_step_ms: u64,
    /// Emit a watched fix at least this often, in milliseconds.
    pub time_interval_ms: u64,
    /// Emit a watched fix after moving this many meters.
    pub distance_interval_m: f64,
    /// How long a one-shot fix may take, in seconds.
    pub fix_timeout_secs: u64,
}

/// Marker registry configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Drop markers not updated for this many seconds.
    /// Set to 0 to keep markers for the whole session.
    pub stale_after_secs: u64,
    /// How conflicting updates are resolved.
    pub ordering: UpdateOrdering,
}

/// Map configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    /// Region shown before the first fix.
    pub initial_region: Region,
    /// Interval between rendered frames in milliseconds.
    pub refresh_interval_ms: u64,
}

/// Default trip and user, used when the CLI does not name them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TripConfig {
    /// Trip to track.
    pub trip_id: Option<String>,
    /// Local user id.
    pub user_id: Option<String>,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            server_url: "http://192.168.1.58:3000".to_string(),
            auth_token: String::new(),
            connect_timeout_secs: 10,
            broadcast_capacity: 64,
        }
    }
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Gpsd,
            gpsd_address: DEFAULT_GPSD_ADDRESS.to_string(),
            replay_file: None,
            replay_step_ms: 1000,
            time_interval_ms: 5000,
            distance_interval_m: 10.0,
            fix_timeout_secs: 10,
        }
    }
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            initial_region: Region::default(),
            refresh_interval_ms: 1000,
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Configuration is loaded in this order (later sources override earlier):
    /// 1. Default values
    /// 2. TOML config file (if exists)
    /// 3. Environment variables (prefixed with `TRIPTRACK_`)
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(CONFIG_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        socket_endpoint(&self.channel.server_url)
            .map_err(|e| Error::config(format!("channel.server_url: {e}")))?;

        if self.channel.connect_timeout_secs == 0 {
            return Err(Error::config(
                "connect_timeout_secs must be greater than 0",
            ));
        }

        if self.channel.broadcast_capacity == 0 {
            return Err(Error::config("broadcast_capacity must be greater than 0"));
        }

        if self.location.time_interval_ms == 0 {
            return Err(Error::config("time_interval_ms must be greater than 0"));
        }

        if !self.location.distance_interval_m.is_finite()
            || self.location.distance_interval_m <= 0.0
        {
            return Err(Error::config(format!(
                "distance_interval_m must be a positive number, got {}",
                self.location.distance_interval_m
            )));
        }

        if self.location.fix_timeout_secs == 0 {
            return Err(Error::config("fix_timeout_secs must be greater than 0"));
        }

        if self.location.provider == ProviderKind::Replay {
            if self.location.replay_file.is_none() {
                return Err(Error::config(
                    "replay provider requires location.replay_file",
                ));
            }
            if self.location.replay_step_ms == 0 {
                return Err(Error::config("replay_step_ms must be greater than 0"));
            }
        }

        let region = &self.map.initial_region;
        if !Position::new(region.latitude, region.longitude).is_valid() {
            return Err(Error::config(format!(
                "initial_region center ({}, {}) is out of range",
                region.latitude, region.longitude
            )));
        }
        if !(region.latitude_delta > 0.0 && region.longitude_delta > 0.0) {
            return Err(Error::config("initial_region deltas must be positive"));
        }

        if self.map.refresh_interval_ms == 0 {
            return Err(Error::config("refresh_interval_ms must be greater than 0"));
        }

        let blank = |id: &Option<String>| id.as_deref().is_some_and(|s| s.trim().is_empty());
        if blank(&self.trip.trip_id) || blank(&self.trip.user_id) {
            return Err(Error::config(INVALID_TRIP));
        }

        Ok(())
    }

    /// Settings for the realtime channel.
    #[must_use]
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            server_url: self.channel.server_url.clone(),
            connect_timeout: Duration::from_secs(self.channel.connect_timeout_secs),
            broadcast_capacity: self.channel.broadcast_capacity,
        }
    }

    /// Cadence options for watched positions.
    #[must_use]
    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            time_interval: Duration::from_millis(self.location.time_interval_ms),
            distance_interval: self.location.distance_interval_m,
        }
    }

    /// Build the configured location provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the replay provider has no track file.
    pub fn location_provider(&self) -> Result<Arc<dyn LocationProvider>> {
        match self.location.provider {
            ProviderKind::Gpsd => Ok(Arc::new(GpsdProvider::new(
                self.location.gpsd_address.clone(),
                self.fix_timeout(),
            ))),
            ProviderKind::Replay => {
                let path = self.location.replay_file.clone().ok_or_else(|| {
                    Error::config("replay provider requires location.replay_file")
                })?;
                Ok(Arc::new(ReplayProvider::new(path, self.replay_step())))
            }
        }
    }

    /// Resolve the trip and user, preferring explicit values over config.
    ///
    /// # Errors
    ///
    /// Returns an error if either id is missing or blank.
    pub fn trip_identity(
        &self,
        trip_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<(TripId, ParticipantId)> {
        let pick = |explicit: Option<&str>, configured: &Option<String>| {
            explicit
                .or(configured.as_deref())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        match (
            pick(trip_id, &self.trip.trip_id),
            pick(user_id, &self.trip.user_id),
        ) {
            (Some(trip), Some(user)) => Ok((TripId::new(trip), ParticipantId::new(user))),
            _ => Err(Error::config(INVALID_TRIP)),
        }
    }

    /// Get the one-shot fix timeout as a Duration.
    #[must_use]
    pub fn fix_timeout(&self) -> Duration {
        Duration::from_secs(self.location.fix_timeout_secs)
    }

    /// Get the replay step as a Duration.
    #[must_use]
    pub fn replay_step(&self) -> Duration {
        Duration::from_millis(self.location.replay_step_ms)
    }

    /// Get the map refresh interval as a Duration.
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.map.refresh_interval_ms)
    }

    /// Get the marker staleness limit, if pruning is enabled.
    #[must_use]
    pub fn stale_after(&self) -> Option<Duration> {
        if self.registry.stale_after_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.registry.stale_after_secs))
        }
    }
}
