//! Location capture for triptrack.
//!
//! A [`LocationProvider`] wraps a concrete location capability (gpsd, a
//! replayed track file). [`PositionSource`] sits on top of a provider and
//! adds the permission gate, the one-shot fix contract and cadence-limited
//! watching through a [`PositionWatch`] handle.

mod gpsd;
mod replay;
mod throttle;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::position::Position;

pub use gpsd::{GpsdProvider, DEFAULT_GPSD_ADDRESS};
pub use replay::ReplayProvider;
pub use throttle::CadenceFilter;

/// Capacity of the channel between a provider and the cadence filter.
const RAW_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the channel between the cadence filter and the subscriber.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Errors reported by location providers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocationError {
    /// The platform denied access to location.
    #[error("location permission denied")]
    PermissionDenied,

    /// The location service could not be reached.
    #[error("location service unavailable: {0}")]
    Unavailable(String),

    /// A one-shot fix could not be acquired.
    #[error("failed to acquire position: {0}")]
    Acquisition(String),

    /// No fix arrived in time.
    #[error("no position fix within {0:?}")]
    Timeout(Duration),

    /// A running position stream failed.
    #[error("position stream failed: {0}")]
    Stream(String),
}

/// Trait for concrete location capabilities.
///
/// Implementors report raw fixes; cadence limiting and the permission gate
/// are handled by [`PositionSource`].
#[async_trait::async_trait]
pub trait LocationProvider: Send + Sync + std::fmt::Debug {
    /// The name of this provider (for logging/debugging).
    fn name(&self) -> &'static str;

    /// Ask for access to location. Returns `false` if access is denied.
    async fn request_permission(&self) -> bool;

    /// Acquire a single fix.
    ///
    /// # Errors
    ///
    /// Returns an error if no fix can be acquired.
    async fn current_position(&self) -> std::result::Result<Position, LocationError>;

    /// Stream raw fixes into `tx`.
    ///
    /// Runs until the stream fails or the receiver is dropped. Returning
    /// `Ok(())` means the stream ended normally.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying stream fails.
    async fn watch(&self, tx: mpsc::Sender<Position>) -> std::result::Result<(), LocationError>;
}

/// Cadence options for watched positions.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchOptions {
    /// Emit a fix at least this often while the device reports.
    pub time_interval: Duration,

    /// Emit a fix whenever the device has moved this many meters.
    pub distance_interval: f64,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            time_interval: Duration::from_secs(5),
            distance_interval: 10.0,
        }
    }
}

/// An event delivered by a [`PositionWatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// A new fix passed the cadence filter.
    Fix(Position),

    /// The stream failed. No further events follow.
    Failed(LocationError),
}

/// Position source with a permission gate and cadence-limited watching.
#[derive(Debug)]
pub struct PositionSource {
    provider: Arc<dyn LocationProvider>,
    options: WatchOptions,
    permission_granted: AtomicBool,
}

impl PositionSource {
    /// Create a position source over the given provider.
    #[must_use]
    pub fn new(provider: Arc<dyn LocationProvider>, options: WatchOptions) -> Self {
        Self {
            provider,
            options,
            permission_granted: AtomicBool::new(false),
        }
    }

    /// The underlying provider name.
    #[must_use]
    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Whether a previous [`request_permission`](Self::request_permission) succeeded.
    #[must_use]
    pub fn has_permission(&self) -> bool {
        self.permission_granted.load(Ordering::SeqCst)
    }

    /// Ask the provider for location access.
    ///
    /// A `false` result is terminal for the tracking feature.
    pub async fn request_permission(&self) -> bool {
        let granted = self.provider.request_permission().await;
        self.permission_granted.store(granted, Ordering::SeqCst);
        if granted {
            debug!(provider = self.provider.name(), "Location permission granted");
        } else {
            warn!(provider = self.provider.name(), "Location permission denied");
        }
        granted
    }

    /// Acquire a single fix, keeping the failure reason.
    ///
    /// # Errors
    ///
    /// Returns the provider's error if no fix can be acquired.
    pub async fn acquire(&self) -> std::result::Result<Position, LocationError> {
        self.provider.current_position().await
    }

    /// Acquire a single fix. Returns `None` on failure; there is no retry.
    pub async fn current_position(&self) -> Option<Position> {
        match self.acquire().await {
            Ok(position) => Some(position),
            Err(e) => {
                warn!(provider = self.provider.name(), error = %e, "Failed to get current position");
                None
            }
        }
    }

    /// Request permission, then take one fix.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Location`] with [`LocationError::PermissionDenied`]
    /// if access is refused, or the provider's error if no fix can be
    /// acquired.
    pub async fn locate(&self) -> Result<Position> {
        if !self.request_permission().await {
            return Err(LocationError::PermissionDenied.into());
        }
        Ok(self.acquire().await?)
    }

    /// Start watching positions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PermissionMissing`] if permission was not granted
    /// first.
    pub fn watch_position(&self) -> Result<PositionWatch> {
        if !self.has_permission() {
            return Err(Error::permission_missing(
                "Location",
                "Request location permission before watching positions",
            ));
        }

        let (raw_tx, mut raw_rx) = mpsc::channel::<Position>(RAW_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<WatchEvent>(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let provider = Arc::clone(&self.provider);
        let options = self.options.clone();
        let token = cancel.clone();

        info!(
            provider = provider.name(),
            interval_ms = options.time_interval.as_millis(),
            distance_m = options.distance_interval,
            "Starting position watch"
        );

        let task = tokio::spawn(async move {
            let mut filter = CadenceFilter::new(options);
            let mut producer = provider.watch(raw_tx);
            let mut producer_done = false;
            let mut failure = None;

            loop {
                tokio::select! {
                    biased;

                    () = token.cancelled() => break,

                    result = &mut producer, if !producer_done => {
                        producer_done = true;
                        if let Err(e) = result {
                            failure = Some(e);
                        }
                    }

                    fix = raw_rx.recv() => {
                        let Some(fix) = fix else {
                            // Producer finished and every buffered fix is drained.
                            if let Some(e) = failure.take() {
                                warn!(error = %e, "Position watch failed");
                                let _ = event_tx.send(WatchEvent::Failed(e)).await;
                            } else {
                                debug!("Position stream ended");
                            }
                            break;
                        };
                        if filter.accept(&fix, tokio::time::Instant::now())
                            && event_tx.send(WatchEvent::Fix(fix)).await.is_err()
                        {
                            debug!("Watch subscriber dropped");
                            break;
                        }
                    }
                }
            }
        });

        Ok(PositionWatch {
            events: event_rx,
            cancel,
            task: Some(task),
        })
    }
}

/// Handle to a running position watch.
///
/// The owner must cancel it (or drop it) to stop updates and release the
/// provider.
#[derive(Debug)]
pub struct PositionWatch {
    events: mpsc::Receiver<WatchEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PositionWatch {
    /// Wait for the next event.
    ///
    /// Returns `None` once the stream has ended, failed, or been cancelled.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let event = self.events.recv().await;
        if self.cancel.is_cancelled() {
            return None;
        }
        event
    }

    /// Stop the watch. No event is delivered after this returns.
    pub fn cancel(&mut self) {
        if self.cancel.is_cancelled() {
            return;
        }
        debug!("Cancelling position watch");
        self.cancel.cancel();
        self.events.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for PositionWatch {
    fn drop(&mut self) {
        self.cancel();
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedProvider;
    use super::*;

    fn every_fix() -> WatchOptions {
        WatchOptions {
            time_interval: Duration::ZERO,
            distance_interval: 0.0,
        }
    }

    fn track() -> Vec<Position> {
        let at = |ms| chrono::TimeZone::timestamp_millis_opt(&chrono::Utc, ms).unwrap();
        vec![
            Position::at(48.85, 2.35, at(1_000)),
            Position::at(48.86, 2.36, at(2_000)),
            Position::at(48.87, 2.37, at(3_000)),
        ]
    }

    #[tokio::test]
    async fn test_request_permission_granted() {
        let source = PositionSource::new(Arc::new(ScriptedProvider::new(track())), every_fix());
        assert!(!source.has_permission());
        assert!(source.request_permission().await);
        assert!(source.has_permission());
    }

    #[tokio::test]
    async fn test_request_permission_denied() {
        let mut provider = ScriptedProvider::new(track());
        provider.granted = false;
        let source = PositionSource::new(Arc::new(provider), every_fix());
        assert!(!source.request_permission().await);
        assert!(!source.has_permission());
    }

    #[tokio::test]
    async fn test_watch_requires_permission() {
        let provider = Arc::new(ScriptedProvider::new(track()));
        let source = PositionSource::new(provider.clone(), every_fix());

        let err = source.watch_position().unwrap_err();
        assert!(err.is_permission_error());
        assert_eq!(*provider.watch_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_current_position() {
        let source = PositionSource::new(Arc::new(ScriptedProvider::new(track())), every_fix());
        let fix = source.current_position().await.unwrap();
        assert!((fix.latitude - 48.85).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_current_position_failure_is_none() {
        let provider = ScriptedProvider::new(Vec::new());
        let source = PositionSource::new(Arc::new(provider), every_fix());
        assert!(source.current_position().await.is_none());
        assert!(matches!(
            source.acquire().await,
            Err(LocationError::Acquisition(_))
        ));
    }

    #[tokio::test]
    async fn test_locate() {
        let source = PositionSource::new(Arc::new(ScriptedProvider::new(track())), every_fix());
        let fix = source.locate().await.unwrap();
        assert_eq!(fix, track()[0]);
        assert!(source.has_permission());
    }

    #[tokio::test]
    async fn test_locate_denied() {
        let mut provider = ScriptedProvider::new(track());
        provider.granted = false;
        let source = PositionSource::new(Arc::new(provider), every_fix());

        let err = source.locate().await.unwrap_err();
        assert!(err.is_permission_error());
        assert!(matches!(
            err,
            Error::Location(LocationError::PermissionDenied)
        ));
    }

    #[tokio::test]
    async fn test_locate_without_fix() {
        let source = PositionSource::new(Arc::new(ScriptedProvider::new(Vec::new())), every_fix());
        let err = source.locate().await.unwrap_err();
        assert!(!err.is_permission_error());
        assert!(matches!(err, Error::Location(LocationError::Acquisition(_))));
    }

    #[tokio::test]
    async fn test_watch_delivers_fixes_in_order() {
        let source = PositionSource::new(Arc::new(ScriptedProvider::new(track())), every_fix());
        assert!(source.request_permission().await);

        let mut watch = source.watch_position().unwrap();
        let mut seen = Vec::new();
        while let Some(event) = watch.next().await {
            match event {
                WatchEvent::Fix(p) => seen.push(p),
                WatchEvent::Failed(e) => panic!("unexpected failure: {e}"),
            }
        }
        assert_eq!(seen, track());
    }

    #[tokio::test]
    async fn test_watch_applies_cadence() {
        let fixes = vec![
            Position::new(48.85, 2.35),
            Position::new(48.850_01, 2.35), // ~1 m
            Position::new(48.851, 2.35),    // ~110 m
        ];
        let options = WatchOptions {
            time_interval: Duration::from_secs(3600),
            distance_interval: 10.0,
        };
        let source = PositionSource::new(Arc::new(ScriptedProvider::new(fixes.clone())), options);
        assert!(source.request_permission().await);

        let mut watch = source.watch_position().unwrap();
        let mut seen = Vec::new();
        while let Some(WatchEvent::Fix(p)) = watch.next().await {
            seen.push(p);
        }
        assert_eq!(seen, vec![fixes[0], fixes[2]]);
    }

    #[tokio::test]
    async fn test_watch_failure_reported_once() {
        let mut provider = ScriptedProvider::new(track());
        provider.failure = Some(LocationError::Stream("device lost".to_string()));
        let source = PositionSource::new(Arc::new(provider), every_fix());
        assert!(source.request_permission().await);

        let mut watch = source.watch_position().unwrap();
        let mut fixes = 0;
        let mut failures = 0;
        while let Some(event) = watch.next().await {
            match event {
                WatchEvent::Fix(_) => fixes += 1,
                WatchEvent::Failed(e) => {
                    failures += 1;
                    assert_eq!(e, LocationError::Stream("device lost".to_string()));
                }
            }
        }
        assert_eq!(fixes, 3);
        assert_eq!(failures, 1);
        assert!(watch.next().await.is_none());
    }

    #[tokio::test]
    async fn test_watch_can_be_restarted_after_failure() {
        let mut provider = ScriptedProvider::new(track());
        provider.failure = Some(LocationError::Stream("device lost".to_string()));
        let provider = Arc::new(provider);
        let source = PositionSource::new(provider.clone(), every_fix());
        assert!(source.request_permission().await);

        let mut first = source.watch_position().unwrap();
        while first.next().await.is_some() {}

        let mut second = source.watch_position().unwrap();
        assert!(matches!(second.next().await, Some(WatchEvent::Fix(_))));
        assert_eq!(*provider.watch_calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_cancel_drops_buffered_events() {
        let mut provider = ScriptedProvider::new(track());
        provider.hold_open = true;
        let source = PositionSource::new(Arc::new(provider), every_fix());
        assert!(source.request_permission().await);

        let mut watch = source.watch_position().unwrap();
        assert!(matches!(watch.next().await, Some(WatchEvent::Fix(_))));

        // Remaining fixes may already be buffered; none may surface.
        watch.cancel();
        assert!(watch.is_cancelled());
        assert!(watch.next().await.is_none());
        assert!(watch.next().await.is_none());
    }

    #[test]
    fn test_watch_options_default() {
        let options = WatchOptions::default();
        assert_eq!(options.time_interval, Duration::from_secs(5));
        assert!((options.distance_interval - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_location_error_display() {
        assert_eq!(
            LocationError::PermissionDenied.to_string(),
            "location permission denied"
        );
        assert!(LocationError::Timeout(Duration::from_secs(10))
            .to_string()
            .contains("10s"));
    }
}
