//! gpsd-backed location provider.
//!
//! Speaks the gpsd JSON protocol over TCP: after connecting, the client
//! enables watch mode and then reads newline-delimited JSON reports. Only
//! `TPV` (time-position-velocity) reports with a 2D or 3D fix are turned into
//! positions.

use std::io::ErrorKind;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{LocationError, LocationProvider};
use crate::position::Position;

/// Default gpsd address.
pub const DEFAULT_GPSD_ADDRESS: &str = "127.0.0.1:2947";

/// Command that switches the gpsd session into JSON watch mode.
const WATCH_COMMAND: &[u8] = b"?WATCH={\"enable\":true,\"json\":true};\n";

/// Minimum TPV mode that carries a usable latitude/longitude.
const MIN_FIX_MODE: u8 = 2;

/// The subset of gpsd reports we care about.
#[derive(Debug, Deserialize)]
#[serde(tag = "class")]
enum Report {
    #[serde(rename = "TPV")]
    Tpv(Tpv),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Tpv {
    #[serde(default)]
    mode: u8,
    time: Option<DateTime<Utc>>,
    lat: Option<f64>,
    lon: Option<f64>,
}

/// Parse a single gpsd report line into a position, if it carries a fix.
fn parse_report(line: &str) -> Option<Position> {
    let report: Report = match serde_json::from_str(line) {
        Ok(report) => report,
        Err(e) => {
            trace!(error = %e, "Ignoring unparseable gpsd line");
            return None;
        }
    };

    let Report::Tpv(tpv) = report else {
        return None;
    };
    if tpv.mode < MIN_FIX_MODE {
        return None;
    }

    let position = Position::at(
        tpv.lat?,
        tpv.lon?,
        tpv.time.unwrap_or_else(Utc::now),
    );
    position.is_valid().then_some(position)
}

/// Location provider reading fixes from a gpsd daemon.
#[derive(Debug, Clone)]
pub struct GpsdProvider {
    address: String,
    fix_timeout: Duration,
}

impl GpsdProvider {
    /// Create a provider for the gpsd daemon at `address`.
    #[must_use]
    pub fn new(address: impl Into<String>, fix_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            fix_timeout,
        }
    }

    async fn connect(&self) -> Result<TcpStream, LocationError> {
        TcpStream::connect(&self.address).await.map_err(|e| {
            if e.kind() == ErrorKind::PermissionDenied {
                LocationError::PermissionDenied
            } else {
                LocationError::Unavailable(format!("{}: {e}", self.address))
            }
        })
    }

    async fn open_session(&self) -> Result<Lines<BufReader<TcpStream>>, LocationError> {
        let mut stream = self.connect().await?;
        stream
            .write_all(WATCH_COMMAND)
            .await
            .map_err(|e| LocationError::Unavailable(format!("failed to enable watch: {e}")))?;
        debug!(address = %self.address, "gpsd watch enabled");
        Ok(BufReader::new(stream).lines())
    }

    /// Read until the next report carrying a fix. `Ok(None)` means gpsd
    /// closed the connection.
    async fn next_fix(
        lines: &mut Lines<BufReader<TcpStream>>,
    ) -> Result<Option<Position>, LocationError> {
        loop {
            let line = lines
                .next_line()
                .await
                .map_err(|e| LocationError::Stream(e.to_string()))?;
            let Some(line) = line else {
                return Ok(None);
            };
            if let Some(position) = parse_report(&line) {
                return Ok(Some(position));
            }
        }
    }
}

impl Default for GpsdProvider {
    fn default() -> Self {
        Self::new(DEFAULT_GPSD_ADDRESS, Duration::from_secs(10))
    }
}

#[async_trait::async_trait]
impl LocationProvider for GpsdProvider {
    fn name(&self) -> &'static str {
        "gpsd"
    }

    async fn request_permission(&self) -> bool {
        match self.connect().await {
            Ok(_) => true,
            Err(e) => {
                warn!(address = %self.address, error = %e, "Cannot access gpsd");
                false
            }
        }
    }

    async fn current_position(&self) -> Result<Position, LocationError> {
        let acquire = async {
            let mut lines = self.open_session().await?;
            Self::next_fix(&mut lines).await?.ok_or_else(|| {
                LocationError::Acquisition("gpsd closed the connection".to_string())
            })
        };

        tokio::time::timeout(self.fix_timeout, acquire)
            .await
            .map_err(|_| LocationError::Timeout(self.fix_timeout))?
    }

    async fn watch(&self, tx: mpsc::Sender<Position>) -> Result<(), LocationError> {
        let mut lines = self.open_session().await?;

        loop {
            tokio::select! {
                () = tx.closed() => {
                    debug!("Position receiver dropped, closing gpsd session");
                    return Ok(());
                }
                fix = Self::next_fix(&mut lines) => {
                    let Some(position) = fix? else {
                        return Err(LocationError::Stream(
                            "gpsd closed the connection".to_string(),
                        ));
                    };
                    if tx.send(position).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}
