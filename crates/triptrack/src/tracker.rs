//! The live trip-tracking feature.
//!
//! A [`TripTracker`] owns one [`PositionSource`], one [`RealtimeChannel`],
//! the [`MarkerRegistry`] and the [`MapView`] for a single trip and user.
//! It runs on one task: location events, inbound broadcasts, channel errors
//! and render ticks are all handled by [`TripTracker::run`], so the registry
//! needs no locking.
//!
//! ```text
//! Idle -> RequestingPermission -> Denied
//!                              -> Acquiring -> Tracking <-> Error
//!                                                 any -> TornDown
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::channel::{
    ChannelError, PositionBroadcast, PositionReport, RealtimeChannel, Subscription,
};
use crate::config::Config;
use crate::location::{PositionSource, PositionWatch, WatchEvent};
use crate::map::{MapFrame, MapView, Region};
use crate::notice::{Notice, NoticeReporter};
use crate::position::{ParticipantId, Position, TripId};
use crate::registry::{MarkerRegistry, UpdateOrdering};

/// Lifecycle of the tracking feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    /// Not started.
    Idle,
    /// Waiting for the location permission answer.
    RequestingPermission,
    /// Location access was denied. Terminal.
    Denied,
    /// Getting the first fix and connecting.
    Acquiring,
    /// Location is being watched. A watch whose stream ended normally (a
    /// replayed track ran out) leaves the tracker here with
    /// [`TripTracker::is_watching`] false until it is restarted.
    Tracking,
    /// Location tracking stopped after a failure. The channel may still run.
    Error,
    /// Torn down. Terminal.
    TornDown,
}

impl std::fmt::Display for TrackerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::RequestingPermission => write!(f, "requesting permission"),
            Self::Denied => write!(f, "denied"),
            Self::Acquiring => write!(f, "acquiring"),
            Self::Tracking => write!(f, "tracking"),
            Self::Error => write!(f, "error"),
            Self::TornDown => write!(f, "torn down"),
        }
    }
}

/// Receives rendered map frames.
pub trait FrameSink: Send + std::fmt::Debug {
    /// Show a frame.
    fn show(&mut self, frame: &MapFrame);
}

/// Per-session tracker settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerOptions {
    /// Trip to track.
    pub trip_id: TripId,
    /// Local user.
    pub user_id: ParticipantId,
    /// Token for the realtime server. Empty for none.
    pub auth_token: String,
    /// Region shown before the first fix.
    pub initial_region: Region,
    /// Minimum time between rendered frames.
    pub refresh_interval: Duration,
    /// Drop participants not heard from for this long.
    pub stale_after: Option<Duration>,
    /// How conflicting participant updates are resolved.
    pub ordering: UpdateOrdering,
}

impl TrackerOptions {
    /// Options with default map and registry settings.
    #[must_use]
    pub fn new(trip_id: TripId, user_id: ParticipantId) -> Self {
        Self {
            trip_id,
            user_id,
            auth_token: String::new(),
            initial_region: Region::default(),
            refresh_interval: Duration::from_secs(1),
            stale_after: None,
            ordering: UpdateOrdering::default(),
        }
    }

    /// Options taken from the loaded configuration.
    #[must_use]
    pub fn from_config(config: &Config, trip_id: TripId, user_id: ParticipantId) -> Self {
        Self {
            trip_id,
            user_id,
            auth_token: config.channel.auth_token.clone(),
            initial_region: config.map.initial_region,
            refresh_interval: config.refresh_interval(),
            stale_after: config.stale_after(),
            ordering: config.registry.ordering,
        }
    }
}

/// Live position tracking for one trip.
#[derive(Debug)]
pub struct TripTracker {
    trip_id: TripId,
    user_id: ParticipantId,
    auth_token: String,
    refresh_interval: Duration,
    stale_after: Option<Duration>,

    source: PositionSource,
    channel: RealtimeChannel,
    registry: MarkerRegistry,
    map: MapView,
    reporter: Arc<dyn NoticeReporter>,

    state: TrackerState,
    watch: Option<PositionWatch>,
    positions: Option<Subscription<PositionBroadcast>>,
    errors: Option<Subscription<ChannelError>>,
    joined: bool,
    dirty: bool,
    last_fix: Option<Position>,
}

impl TripTracker {
    /// Create an idle tracker.
    #[must_use]
    pub fn new(
        options: TrackerOptions,
        source: PositionSource,
        channel: RealtimeChannel,
        reporter: Arc<dyn NoticeReporter>,
    ) -> Self {
        let map = MapView::new(options.user_id.clone(), options.initial_region);
        Self {
            trip_id: options.trip_id,
            user_id: options.user_id,
            auth_token: options.auth_token,
            refresh_interval: options.refresh_interval,
            stale_after: options.stale_after,
            source,
            channel,
            registry: MarkerRegistry::with_ordering(options.ordering),
            map,
            reporter,
            state: TrackerState::Idle,
            watch: None,
            positions: None,
            errors: None,
            joined: false,
            dirty: true,
            last_fix: None,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TrackerState {
        self.state
    }

    /// The trip being tracked.
    #[must_use]
    pub fn trip_id(&self) -> &TripId {
        &self.trip_id
    }

    /// The local user.
    #[must_use]
    pub fn user_id(&self) -> &ParticipantId {
        &self.user_id
    }

    /// Participants seen so far.
    #[must_use]
    pub fn registry(&self) -> &MarkerRegistry {
        &self.registry
    }

    /// The map view.
    #[must_use]
    pub fn map(&self) -> &MapView {
        &self.map
    }

    /// The realtime channel.
    #[must_use]
    pub fn channel(&self) -> &RealtimeChannel {
        &self.channel
    }

    /// The most recent local fix.
    #[must_use]
    pub fn last_fix(&self) -> Option<Position> {
        self.last_fix
    }

    /// Whether a position watch is running.
    #[must_use]
    pub fn is_watching(&self) -> bool {
        self.watch.is_some()
    }

    /// Render the current state of the map.
    #[must_use]
    pub fn frame(&self) -> MapFrame {
        self.map.render(&self.registry.snapshot())
    }

    /// Bring the feature up.
    ///
    /// Permission is requested first; a denial is terminal and nothing else
    /// starts. Then the channel connects and joins the trip room, the
    /// initial fix is taken and published, and the position watch starts.
    /// Failures past the permission gate are reported and do not stop the
    /// remaining steps.
    pub async fn start(&mut self) -> TrackerState {
        if self.state != TrackerState::Idle {
            warn!(state = %self.state, "Tracker already started");
            return self.state;
        }

        if self.trip_id.as_str().trim().is_empty() || self.user_id.as_str().trim().is_empty() {
            self.reporter.report(Notice::invalid_trip());
            self.state = TrackerState::Error;
            return self.state;
        }

        info!(trip_id = %self.trip_id, user_id = %self.user_id, "Starting trip tracking");

        self.state = TrackerState::RequestingPermission;
        if !self.source.request_permission().await {
            self.reporter.report(Notice::permission_denied());
            self.state = TrackerState::Denied;
            return self.state;
        }

        self.state = TrackerState::Acquiring;
        self.connect_channel().await;

        match self.source.acquire().await {
            Ok(fix) => self.handle_fix(fix),
            Err(e) => {
                warn!(error = %e, "Failed to get initial position");
                self.reporter.report(Notice::acquisition_failed());
            }
        }

        self.start_watch();
        self.state
    }

    /// Start a fresh position watch after a failure or after the previous
    /// stream ended.
    ///
    /// Returns the resulting state.
    pub fn restart_watch(&mut self) -> TrackerState {
        match self.state {
            TrackerState::Tracking | TrackerState::Error if self.watch.is_none() => {
                self.start_watch();
            }
            _ => debug!(state = %self.state, "Watch restart not applicable"),
        }
        self.state
    }

    /// Handle events until `shutdown` resolves.
    ///
    /// Frames are rendered into `sink` at most once per refresh interval and
    /// only when something changed. Returns immediately if the feature is
    /// not running.
    pub async fn run<F>(&mut self, sink: &mut dyn FrameSink, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        if !matches!(self.state, TrackerState::Tracking | TrackerState::Error) {
            debug!(state = %self.state, "Tracker not running, nothing to do");
            return;
        }

        let mut ticker = interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                () = &mut shutdown => {
                    debug!("Shutdown requested");
                    break;
                }

                event = next_watch_event(&mut self.watch), if self.watch.is_some() => {
                    self.handle_watch_event(event);
                }

                update = next_item(&mut self.positions), if self.positions.is_some() => {
                    match update {
                        Some(update) => self.handle_broadcast(update),
                        None => self.positions = None,
                    }
                }

                error = next_item(&mut self.errors), if self.errors.is_some() => {
                    match error {
                        Some(error) => self.handle_channel_error(&error),
                        None => self.errors = None,
                    }
                }

                _ = ticker.tick() => {
                    self.prune();
                    if self.dirty {
                        sink.show(&self.frame());
                        self.dirty = false;
                    }
                }
            }
        }

        if self.dirty {
            sink.show(&self.frame());
            self.dirty = false;
        }
    }

    /// Stop everything: cancel the watch, leave the room, then disconnect.
    ///
    /// Safe to call more than once.
    pub async fn teardown(&mut self) {
        if self.state == TrackerState::TornDown {
            return;
        }

        if let Some(mut watch) = self.watch.take() {
            watch.cancel();
        }

        if self.joined {
            if let Err(e) = self.channel.leave_room(&self.trip_id) {
                debug!(error = %e, "Could not leave trip room");
            }
            self.joined = false;
        }

        self.positions = None;
        self.errors = None;
        self.channel.disconnect().await;

        self.state = TrackerState::TornDown;
        info!(trip_id = %self.trip_id, "Trip tracking stopped");
    }

    async fn connect_channel(&mut self) {
        let result = async {
            self.channel.connect(&self.auth_token).await?;
            self.channel.join_room(&self.trip_id)?;
            self.joined = true;
            let positions = self.channel.subscribe_positions()?;
            let errors = self.channel.subscribe_errors()?;
            Ok::<_, ChannelError>((positions, errors))
        }
        .await;

        match result {
            Ok((positions, errors)) => {
                self.positions = Some(positions);
                self.errors = Some(errors);
                debug!(trip_id = %self.trip_id, "Joined trip room");
            }
            Err(e) => {
                warn!(error = %e, "Realtime setup failed");
                self.reporter.report(Notice::channel_failed());
            }
        }
    }

    fn start_watch(&mut self) {
        match self.source.watch_position() {
            Ok(watch) => {
                self.watch = Some(watch);
                self.state = TrackerState::Tracking;
            }
            Err(e) => {
                warn!(error = %e, "Failed to start position watch");
                self.reporter.report(Notice::setup_failed());
                self.state = TrackerState::Error;
            }
        }
    }

    fn handle_fix(&mut self, fix: Position) {
        self.last_fix = Some(fix);
        self.map.on_fix(fix);
        self.channel.publish_position(&PositionReport::new(
            self.user_id.clone(),
            self.trip_id.clone(),
            &fix,
        ));
        self.dirty = true;
    }

    fn handle_watch_event(&mut self, event: Option<WatchEvent>) {
        match event {
            Some(WatchEvent::Fix(fix)) => self.handle_fix(fix),
            Some(WatchEvent::Failed(e)) => {
                warn!(error = %e, "Position watch failed");
                self.reporter.report(Notice::tracking_failed());
                self.watch = None;
                self.state = TrackerState::Error;
            }
            None => {
                debug!("Position watch ended");
                self.watch = None;
            }
        }
    }

    fn handle_broadcast(&mut self, update: PositionBroadcast) {
        self.registry
            .apply_update(update.participant_id, update.position);
        self.dirty = true;
    }

    fn handle_channel_error(&mut self, error: &ChannelError) {
        warn!(error = %error, "Realtime channel error");
        self.reporter.report(Notice::channel_error());
        if !self.channel.is_connected() {
            // No reconnection; nothing more will arrive.
            self.positions = None;
            self.errors = None;
            self.joined = false;
        }
    }

    fn prune(&mut self) {
        if let Some(max_age) = self.stale_after {
            if self.registry.prune_stale(Utc::now(), max_age) > 0 {
                self.dirty = true;
            }
        }
    }
}

async fn next_watch_event(watch: &mut Option<PositionWatch>) -> Option<WatchEvent> {
    match watch {
        Some(watch) => watch.next().await,
        None => std::future::pending().await,
    }
}

async fn next_item<T: Clone>(subscription: &mut Option<Subscription<T>>) -> Option<T> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}
