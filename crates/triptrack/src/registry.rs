//! In-memory registry of trip participants' last-known positions.
//!
//! The registry is owned by a single tracker task and needs no locking.
//! By default updates win by arrival order: a later-arriving update always
//! replaces the stored one, even if its timestamp is older.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::position::{ParticipantId, Position};

/// A renderable participant pin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParticipantMarker {
    /// Who this marker belongs to.
    pub participant_id: ParticipantId,
    /// Last-known position, stamped with the sender's time.
    pub coordinate: Position,
    /// When the last update arrived locally.
    pub last_updated: DateTime<Utc>,
}

/// How conflicting updates for the same participant are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOrdering {
    /// The most recently arrived update wins.
    #[default]
    Arrival,
    /// Updates older than the stored position are discarded.
    Timestamp,
}

impl std::fmt::Display for UpdateOrdering {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Arrival => write!(f, "arrival"),
            Self::Timestamp => write!(f, "timestamp"),
        }
    }
}

/// Outcome of applying an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// A marker was created for a new participant.
    Created,
    /// An existing marker was overwritten.
    Updated,
    /// The update was older than the stored one and was discarded.
    Ignored,
}

/// Participant id to last-known position.
#[derive(Debug, Default)]
pub struct MarkerRegistry {
    markers: HashMap<ParticipantId, ParticipantMarker>,
    ordering: UpdateOrdering,
}

impl MarkerRegistry {
    /// Create an empty registry with arrival-order updates.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry with the given ordering policy.
    #[must_use]
    pub fn with_ordering(ordering: UpdateOrdering) -> Self {
        Self {
            markers: HashMap::new(),
            ordering,
        }
    }

    /// Upsert a participant's position, stamped as arriving now.
    pub fn apply_update(&mut self, participant_id: ParticipantId, position: Position) -> UpdateOutcome {
        self.apply_update_at(participant_id, position, Utc::now())
    }

    /// Upsert a participant's position with an explicit arrival time.
    pub fn apply_update_at(
        &mut self,
        participant_id: ParticipantId,
        position: Position,
        received_at: DateTime<Utc>,
    ) -> UpdateOutcome {
        if let Some(marker) = self.markers.get_mut(&participant_id) {
            if self.ordering == UpdateOrdering::Timestamp
                && position.timestamp < marker.coordinate.timestamp
            {
                debug!(
                    participant = %participant_id,
                    stored = %marker.coordinate.timestamp,
                    incoming = %position.timestamp,
                    "Discarding out-of-order position"
                );
                return UpdateOutcome::Ignored;
            }
            marker.coordinate = position;
            marker.last_updated = received_at;
            trace!(participant = %participant_id, position = %position, "Marker updated");
            return UpdateOutcome::Updated;
        }

        debug!(participant = %participant_id, position = %position, "New participant marker");
        self.markers.insert(
            participant_id.clone(),
            ParticipantMarker {
                participant_id,
                coordinate: position,
                last_updated: received_at,
            },
        );
        UpdateOutcome::Created
    }

    /// A point-in-time copy of every marker, ordered by participant id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ParticipantMarker> {
        let mut markers: Vec<_> = self.markers.values().cloned().collect();
        markers.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        markers
    }

    /// Look up one participant's marker.
    #[must_use]
    pub fn get(&self, participant_id: &ParticipantId) -> Option<&ParticipantMarker> {
        self.markers.get(participant_id)
    }

    /// Remove a participant's marker.
    pub fn remove(&mut self, participant_id: &ParticipantId) -> Option<ParticipantMarker> {
        self.markers.remove(participant_id)
    }

    /// Drop markers that have not been updated within `max_age` of `now`.
    ///
    /// Returns the number of markers removed.
    pub fn prune_stale(&mut self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let cutoff = now - max_age;

        let before = self.markers.len();
        self.markers.retain(|id, marker| {
            let keep = marker.last_updated >= cutoff;
            if !keep {
                debug!(participant = %id, last_updated = %marker.last_updated, "Pruning stale marker");
            }
            keep
        });
        before - self.markers.len()
    }

    /// Number of markers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.markers.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}
