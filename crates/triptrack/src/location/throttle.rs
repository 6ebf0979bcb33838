//! Cadence filtering for watched positions.
//!
//! Raw providers may report far more often than the tracker needs. The
//! filter passes a fix when enough time has elapsed since the last emitted
//! fix, or the device has moved far enough, whichever triggers first.

use tokio::time::Instant;
use tracing::trace;

use super::WatchOptions;
use crate::position::Position;

/// Decides which raw fixes are forwarded to watch subscribers.
#[derive(Debug)]
pub struct CadenceFilter {
    options: WatchOptions,
    last: Option<(Position, Instant)>,
}

impl CadenceFilter {
    /// Create a filter that has not emitted anything yet.
    #[must_use]
    pub fn new(options: WatchOptions) -> Self {
        Self {
            options,
            last: None,
        }
    }

    /// Check a raw fix observed at `now`, recording it if it passes.
    ///
    /// The first fix always passes.
    pub fn accept(&mut self, fix: &Position, now: Instant) -> bool {
        let Some((last, emitted_at)) = &self.last else {
            self.last = Some((*fix, now));
            return true;
        };

        let elapsed = now.saturating_duration_since(*emitted_at);
        let moved = last.distance_to(fix);

        if elapsed >= self.options.time_interval || moved >= self.options.distance_interval {
            self.last = Some((*fix, now));
            true
        } else {
            trace!(
                elapsed_ms = elapsed.as_millis(),
                moved_m = moved,
                "Suppressing fix below watch cadence"
            );
            false
        }
    }

    /// Forget the last emitted fix so the next one always passes.
    pub fn reset(&mut self) {
        self.last = None;
    }
}
