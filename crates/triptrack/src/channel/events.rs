//! Trip-room events exchanged with the realtime server.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::position::{ParticipantId, Position, TripId};

/// Outbound: join a trip room.
pub const JOIN_TRIP: &str = "joinTrip";

/// Outbound: leave a trip room.
pub const LEAVE_TRIP: &str = "leaveTrip";

/// Outbound: publish the local user's position.
pub const UPDATE_POSITION: &str = "updatePosition";

/// Inbound: another participant's position.
pub const POSITION_UPDATE: &str = "positionUpdate";

/// The local user's position, as published into a trip room.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionReport {
    /// Publishing user.
    pub user_id: ParticipantId,
    /// Room to publish into.
    pub trip_id: TripId,
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
}

impl PositionReport {
    /// Build a report for `position`.
    #[must_use]
    pub fn new(user_id: ParticipantId, trip_id: TripId, position: &Position) -> Self {
        Self {
            user_id,
            trip_id,
            latitude: position.latitude,
            longitude: position.longitude,
        }
    }
}

/// A participant's position received from the trip room.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionBroadcast {
    /// Who the position belongs to.
    pub participant_id: ParticipantId,
    /// Where they are, stamped with the sender's time when provided.
    pub position: Position,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePositionUpdate {
    user_id: ParticipantId,
    position: WirePosition,
}

#[derive(Debug, Deserialize)]
struct WirePosition {
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    timestamp: Option<WireTimestamp>,
}

/// The server may send epoch milliseconds or an ISO 8601 string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Millis(i64),
    Iso(DateTime<Utc>),
}

impl WireTimestamp {
    fn resolve(self) -> Option<DateTime<Utc>> {
        match self {
            Self::Millis(ms) => Utc.timestamp_millis_opt(ms).single(),
            Self::Iso(ts) => Some(ts),
        }
    }
}

impl PositionBroadcast {
    /// Decode a `positionUpdate` payload.
    ///
    /// A missing or unusable timestamp falls back to `received_at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not match the wire shape.
    pub fn from_wire(data: Value, received_at: DateTime<Utc>) -> Result<Self, serde_json::Error> {
        let wire: WirePositionUpdate = serde_json::from_value(data)?;
        let timestamp = wire
            .position
            .timestamp
            .and_then(WireTimestamp::resolve)
            .unwrap_or(received_at);

        Ok(Self {
            participant_id: wire.user_id,
            position: Position::at(wire.position.latitude, wire.position.longitude, timestamp),
        })
    }
}
