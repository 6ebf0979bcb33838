//! User-facing error notices.
//!
//! Every failure in the tracking feature reaches the user as a short
//! [`Notice`] delivered to a [`NoticeReporter`]. The reporter decides how to
//! show it: the CLI prints to stderr, tests collect notices in memory.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

/// How long a notice stays on screen.
pub const NOTICE_DURATION: Duration = Duration::from_millis(3000);

/// Shown when location access is denied.
pub const PERMISSION_REQUIRED: &str = "Location permission is required for this feature";

/// Shown when the initial fix cannot be acquired.
pub const LOCATION_UNAVAILABLE: &str = "Unable to get current location";

/// Shown when a running position watch fails.
pub const TRACKING_FAILED: &str = "Unable to track location";

/// Shown when the position watch cannot be started.
pub const LOCATION_SETUP_FAILED: &str = "Failed to setup location services";

/// Shown when the realtime channel cannot be set up.
pub const REALTIME_FAILED: &str = "Failed to connect to real-time services";

/// Shown when a connected realtime channel reports an error.
pub const REALTIME_ERROR: &str = "Problem receiving real-time updates";

/// Shown when the trip or user id is missing.
pub const INVALID_TRIP: &str = "Invalid trip or user information";

/// Failure category behind a notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// Location access was denied. Terminal for the feature.
    PermissionDenied,
    /// A one-shot fix failed.
    AcquisitionFailure,
    /// The position watch failed or could not be started.
    WatchFailure,
    /// The realtime channel failed to connect or broke at runtime.
    Channel,
    /// The feature was started without a trip or user.
    InvalidTrip,
}

/// A message for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    /// Failure category.
    pub kind: NoticeKind,
    /// Text to show.
    pub message: String,
    /// How long to show it.
    #[serde(serialize_with = "serialize_millis")]
    pub duration: Duration,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u128(d.as_millis())
}

impl Notice {
    /// Create a notice with the standard display duration.
    #[must_use]
    pub fn new(kind: NoticeKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            duration: NOTICE_DURATION,
        }
    }

    /// The notice for a denied location permission.
    #[must_use]
    pub fn permission_denied() -> Self {
        Self::new(NoticeKind::PermissionDenied, PERMISSION_REQUIRED)
    }

    /// The notice for a failed initial fix.
    #[must_use]
    pub fn acquisition_failed() -> Self {
        Self::new(NoticeKind::AcquisitionFailure, LOCATION_UNAVAILABLE)
    }

    /// The notice for a watch that failed while running.
    #[must_use]
    pub fn tracking_failed() -> Self {
        Self::new(NoticeKind::WatchFailure, TRACKING_FAILED)
    }

    /// The notice for a watch that could not be started.
    #[must_use]
    pub fn setup_failed() -> Self {
        Self::new(NoticeKind::WatchFailure, LOCATION_SETUP_FAILED)
    }

    /// The notice for a realtime channel that could not be set up.
    #[must_use]
    pub fn channel_failed() -> Self {
        Self::new(NoticeKind::Channel, REALTIME_FAILED)
    }

    /// The notice for an error on a connected realtime channel.
    #[must_use]
    pub fn channel_error() -> Self {
        Self::new(NoticeKind::Channel, REALTIME_ERROR)
    }

    /// The notice for a missing trip or user id.
    #[must_use]
    pub fn invalid_trip() -> Self {
        Self::new(NoticeKind::InvalidTrip, INVALID_TRIP)
    }
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Sink for user-facing notices.
pub trait NoticeReporter: Send + Sync + std::fmt::Debug {
    /// Show a notice to the user.
    fn report(&self, notice: Notice);
}

/// Prints notices to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleReporter;

impl NoticeReporter for ConsoleReporter {
    fn report(&self, notice: Notice) {
        warn!(kind = ?notice.kind, "{}", notice.message);
        eprintln!("! {notice}");
    }
}

/// Keeps notices in memory.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    notices: Mutex<Vec<Notice>>,
}

impl MemoryReporter {
    /// Create an empty reporter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything reported so far.
    #[must_use]
    pub fn notices(&self) -> Vec<Notice> {
        self.notices
            .lock()
            .map(|n| n.clone())
            .unwrap_or_default()
    }

    /// The kinds reported so far, in order.
    #[must_use]
    pub fn kinds(&self) -> Vec<NoticeKind> {
        self.notices().iter().map(|n| n.kind).collect()
    }
}

impl NoticeReporter for MemoryReporter {
    fn report(&self, notice: Notice) {
        if let Ok(mut notices) = self.notices.lock() {
            notices.push(notice);
        }
    }
}
