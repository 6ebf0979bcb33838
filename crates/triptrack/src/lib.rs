//! `triptrack` - Live trip-position tracking
//!
//! This library publishes the local user's position into a trip room over a
//! realtime channel, tracks the last-known position of every other
//! participant, and renders them as map pins.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod channel;
pub mod cli;
pub mod config;
pub mod error;
pub mod location;
pub mod logging;
pub mod map;
pub mod notice;
pub mod position;
pub mod registry;
pub mod tracker;

pub use channel::{ChannelConfig, ChannelError, RealtimeChannel};
pub use config::Config;
pub use error::{Error, Result};
pub use location::{LocationError, LocationProvider, PositionSource, WatchOptions};
pub use logging::init_logging;
pub use map::{MapFrame, MapView, Region};
pub use notice::{Notice, NoticeKind, NoticeReporter};
pub use position::{ParticipantId, Position, TripId};
pub use registry::{MarkerRegistry, ParticipantMarker, UpdateOrdering};
pub use tracker::{FrameSink, TrackerOptions, TrackerState, TripTracker};
