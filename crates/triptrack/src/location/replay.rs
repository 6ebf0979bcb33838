//! Track-file replay provider.
//!
//! Replays a recorded track, one fix per step. The file holds one JSON
//! object per line with `latitude` and `longitude` fields; blank lines and
//! lines starting with `#` are skipped. Fixes are stamped with the time they
//! are replayed.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use super::{LocationError, LocationProvider};
use crate::position::Position;

#[derive(Debug, Deserialize)]
struct TrackPoint {
    latitude: f64,
    longitude: f64,
}

/// Location provider that replays a recorded track.
#[derive(Debug, Clone)]
pub struct ReplayProvider {
    path: PathBuf,
    step: Duration,
}

impl ReplayProvider {
    /// Create a provider replaying `path`, one fix every `step`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, step: Duration) -> Self {
        Self {
            path: path.into(),
            step,
        }
    }

    async fn load(&self) -> Result<Vec<(f64, f64)>, LocationError> {
        let text = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            LocationError::Unavailable(format!("{}: {e}", self.path.display()))
        })?;
        parse_track(&text)
    }
}

fn parse_track(text: &str) -> Result<Vec<(f64, f64)>, LocationError> {
    text.lines()
        .enumerate()
        .map(|(n, line)| (n + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(n, line)| {
            let point: TrackPoint = serde_json::from_str(line)
                .map_err(|e| LocationError::Stream(format!("track line {n}: {e}")))?;
            if Position::new(point.latitude, point.longitude).is_valid() {
                Ok((point.latitude, point.longitude))
            } else {
                Err(LocationError::Stream(format!(
                    "track line {n}: coordinate out of range"
                )))
            }
        })
        .collect()
}

#[async_trait::async_trait]
impl LocationProvider for ReplayProvider {
    fn name(&self) -> &'static str {
        "replay"
    }

    async fn request_permission(&self) -> bool {
        tokio::fs::metadata(&self.path)
            .await
            .is_ok_and(|meta| meta.is_file())
    }

    async fn current_position(&self) -> Result<Position, LocationError> {
        let track = self
            .load()
            .await
            .map_err(|e| LocationError::Acquisition(e.to_string()))?;
        track
            .first()
            .map(|&(lat, lon)| Position::new(lat, lon))
            .ok_or_else(|| LocationError::Acquisition("track file is empty".to_string()))
    }

    async fn watch(&self, tx: mpsc::Sender<Position>) -> Result<(), LocationError> {
        let track = self.load().await?;
        debug!(
            path = %self.path.display(),
            points = track.len(),
            step_ms = self.step.as_millis(),
            "Replaying track"
        );

        let mut ticker = interval(self.step);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        for (lat, lon) in track {
            ticker.tick().await;
            if tx.send(Position::new(lat, lon)).await.is_err() {
                debug!("Position receiver dropped, stopping replay");
                return Ok(());
            }
        }

        debug!("Track replay finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_track(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "triptrack-{name}-{}.jsonl",
            std::process::id()
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_parse_track() {
        let text = "# morning walk\n{\"latitude\":48.85,\"longitude\":2.35}\n\n{\"latitude\":48.86,\"longitude\":2.36}\n";
        let track = parse_track(text).unwrap();
        assert_eq!(track, vec![(48.85, 2.35), (48.86, 2.36)]);
    }

    #[test]
    fn test_parse_track_reports_line() {
        let text = "{\"latitude\":48.85,\"longitude\":2.35}\nnope\n";
        let err = parse_track(text).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_parse_track_rejects_out_of_range() {
        let err = parse_track("{\"latitude\":95.0,\"longitude\":2.35}").unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[tokio::test]
    async fn test_permission_requires_file() {
        let missing = ReplayProvider::new("/nonexistent/track.jsonl", Duration::from_millis(1));
        assert!(!missing.request_permission().await);

        let path = temp_track("perm", "{\"latitude\":1.0,\"longitude\":2.0}\n");
        let present = ReplayProvider::new(&path, Duration::from_millis(1));
        assert!(present.request_permission().await);
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_current_position_is_first_point() {
        let path = temp_track(
            "first",
            "{\"latitude\":1.0,\"longitude\":2.0}\n{\"latitude\":3.0,\"longitude\":4.0}\n",
        );
        let provider = ReplayProvider::new(&path, Duration::from_millis(1));
        let pos = provider.current_position().await.unwrap();
        assert!((pos.latitude - 1.0).abs() < f64::EPSILON);
        assert!((pos.longitude - 2.0).abs() < f64::EPSILON);
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_current_position_empty_track() {
        let path = temp_track("empty", "# nothing here\n");
        let provider = ReplayProvider::new(&path, Duration::from_millis(1));
        assert!(matches!(
            provider.current_position().await,
            Err(LocationError::Acquisition(_))
        ));
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_watch_replays_all_points() {
        let path = temp_track(
            "watch",
            "{\"latitude\":1.0,\"longitude\":2.0}\n{\"latitude\":3.0,\"longitude\":4.0}\n",
        );
        let provider = ReplayProvider::new(&path, Duration::from_millis(1));
        let (tx, mut rx) = mpsc::channel(8);
        provider.watch(tx).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!((first.latitude - 1.0).abs() < f64::EPSILON);
        assert!((second.latitude - 3.0).abs() < f64::EPSILON);
        assert!(rx.recv().await.is_none());
        std::fs::remove_file(path).ok();
    }
}
