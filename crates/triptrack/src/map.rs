//! Map view over the marker registry.
//!
//! [`MapView`] turns registry snapshots into [`MapFrame`]s: one labelled pin
//! per participant, the local user's own location, and the visible region.
//! Frames render as plain text for a terminal or as JSON for other tools.

use std::fmt::Write as _;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::position::{ParticipantId, Position};
use crate::registry::ParticipantMarker;

/// Label for the local user's own pin.
pub const SELF_LABEL: &str = "You";

/// The visible area of the map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Region {
    /// Center latitude.
    pub latitude: f64,
    /// Center longitude.
    pub longitude: f64,
    /// Latitude span in degrees.
    pub latitude_delta: f64,
    /// Longitude span in degrees.
    pub longitude_delta: f64,
}

impl Default for Region {
    /// Central Paris.
    fn default() -> Self {
        Self {
            latitude: 48.8566,
            longitude: 2.3522,
            latitude_delta: 0.0922,
            longitude_delta: 0.0421,
        }
    }
}

impl Region {
    /// The same span, centered on `position`.
    #[must_use]
    pub fn centered_on(&self, position: &Position) -> Self {
        Self {
            latitude: position.latitude,
            longitude: position.longitude,
            ..*self
        }
    }

    /// Whether `position` falls inside the region.
    #[must_use]
    pub fn contains(&self, position: &Position) -> bool {
        (position.latitude - self.latitude).abs() <= self.latitude_delta / 2.0
            && (position.longitude - self.longitude).abs() <= self.longitude_delta / 2.0
    }
}

/// Pin color, taken from the app theme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PinColor {
    /// The local user.
    Primary,
    /// Everyone else.
    Secondary,
}

/// A labelled pin on the map.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pin {
    /// Participant the pin belongs to.
    pub participant_id: ParticipantId,
    /// Pin title.
    pub label: String,
    /// Pin subtitle.
    pub description: String,
    /// Pin color.
    pub color: PinColor,
    /// Pin latitude.
    pub latitude: f64,
    /// Pin longitude.
    pub longitude: f64,
}

/// One rendered state of the map.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapFrame {
    /// Visible region.
    pub region: Region,
    /// The local device's latest fix, if any.
    pub user_location: Option<Position>,
    /// One pin per participant, ordered by participant id.
    pub pins: Vec<Pin>,
    /// When the frame was rendered.
    pub rendered_at: DateTime<Utc>,
}

impl MapFrame {
    /// Whether the map is still waiting for the first local fix.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.user_location.is_none()
    }

    /// Render as human-readable text.
    #[must_use]
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Map centered on ({:.5}, {:.5}), span {:.4} x {:.4}",
            self.region.latitude,
            self.region.longitude,
            self.region.latitude_delta,
            self.region.longitude_delta
        );
        match &self.user_location {
            Some(position) => {
                let _ = writeln!(out, "  My location: {position}");
            }
            None => {
                let _ = writeln!(out, "  Waiting for location...");
            }
        }
        if self.pins.is_empty() {
            let _ = writeln!(out, "  No travelers yet");
        }
        for pin in &self.pins {
            let marker = match pin.color {
                PinColor::Primary => '*',
                PinColor::Secondary => 'o',
            };
            let _ = writeln!(
                out,
                "  {marker} {:<20} ({:.5}, {:.5})  {}",
                pin.label, pin.latitude, pin.longitude, pin.description
            );
        }
        out
    }

    /// Render as a single line of JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// The map for one local user.
#[derive(Debug, Clone)]
pub struct MapView {
    local_user: ParticipantId,
    region: Region,
    user_location: Option<Position>,
    recentered: bool,
}

impl MapView {
    /// Create a map showing `initial_region` until the first fix arrives.
    #[must_use]
    pub fn new(local_user: ParticipantId, initial_region: Region) -> Self {
        Self {
            local_user,
            region: initial_region,
            user_location: None,
            recentered: false,
        }
    }

    /// The visible region.
    #[must_use]
    pub fn region(&self) -> Region {
        self.region
    }

    /// Whether the map has recentered on a fix yet.
    #[must_use]
    pub fn has_recentered(&self) -> bool {
        self.recentered
    }

    /// Record a local fix. The map recenters on the first fix only.
    ///
    /// Returns `true` if this call recentered the map.
    pub fn on_fix(&mut self, position: Position) -> bool {
        self.user_location = Some(position);
        if self.recentered {
            return false;
        }
        self.region = self.region.centered_on(&position);
        self.recentered = true;
        debug!(position = %position, "Map recentered on first fix");
        true
    }

    /// Build a frame from a registry snapshot.
    #[must_use]
    pub fn render(&self, markers: &[ParticipantMarker]) -> MapFrame {
        MapFrame {
            region: self.region,
            user_location: self.user_location,
            pins: markers.iter().map(|m| self.pin_for(m)).collect(),
            rendered_at: Utc::now(),
        }
    }

    fn pin_for(&self, marker: &ParticipantMarker) -> Pin {
        let is_self = marker.participant_id == self.local_user;
        let (label, color) = if is_self {
            (SELF_LABEL.to_string(), PinColor::Primary)
        } else {
            (
                format!("Traveler {}", marker.participant_id),
                PinColor::Secondary,
            )
        };
        Pin {
            participant_id: marker.participant_id.clone(),
            label,
            description: format!(
                "Last updated: {}",
                marker
                    .coordinate
                    .timestamp
                    .with_timezone(&Local)
                    .format("%H:%M:%S")
            ),
            color,
            latitude: marker.coordinate.latitude,
            longitude: marker.coordinate.longitude,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MarkerRegistry;

    fn view() -> MapView {
        MapView::new(ParticipantId::from("me"), Region::default())
    }

    #[test]
    fn test_default_region_is_paris() {
        let region = Region::default();
        assert!((region.latitude - 48.8566).abs() < f64::EPSILON);
        assert!((region.longitude - 2.3522).abs() < f64::EPSILON);
        assert!((region.latitude_delta - 0.0922).abs() < f64::EPSILON);
        assert!((region.longitude_delta - 0.0421).abs() < f64::EPSILON);
    }

    #[test]
    fn test_recenter_only_once() {
        let mut map = view();
        assert!(!map.has_recentered());

        let first = Position::new(45.76, 4.83);
        assert!(map.on_fix(first));
        assert!((map.region().latitude - 45.76).abs() < f64::EPSILON);

        let second = Position::new(43.30, 5.37);
        assert!(!map.on_fix(second));
        assert!((map.region().latitude - 45.76).abs() < f64::EPSILON);

        // The user location still follows the device.
        assert_eq!(map.render(&[]).user_location, Some(second));
    }

    #[test]
    fn test_recenter_keeps_span() {
        let mut map = view();
        map.on_fix(Position::new(45.76, 4.83));
        assert!((map.region().latitude_delta - 0.0922).abs() < f64::EPSILON);
        assert!((map.region().longitude_delta - 0.0421).abs() < f64::EPSILON);
    }

    #[test]
    fn test_render_labels_and_colors() {
        let mut registry = MarkerRegistry::new();
        registry.apply_update(ParticipantId::from("me"), Position::new(48.85, 2.35));
        registry.apply_update(ParticipantId::from("u2"), Position::new(48.86, 2.36));

        let frame = view().render(&registry.snapshot());
        assert_eq!(frame.pins.len(), 2);

        let me = frame.pins.iter().find(|p| p.participant_id.as_str() == "me").unwrap();
        assert_eq!(me.label, "You");
        assert_eq!(me.color, PinColor::Primary);

        let other = frame.pins.iter().find(|p| p.participant_id.as_str() == "u2").unwrap();
        assert_eq!(other.label, "Traveler u2");
        assert_eq!(other.color, PinColor::Secondary);
        assert!(other.description.starts_with("Last updated: "));
    }

    #[test]
    fn test_loading_until_first_fix() {
        let mut map = view();
        assert!(map.render(&[]).is_loading());
        map.on_fix(Position::new(48.85, 2.35));
        assert!(!map.render(&[]).is_loading());
    }

    #[test]
    fn test_region_contains() {
        let region = Region::default();
        assert!(region.contains(&Position::new(48.86, 2.35)));
        assert!(!region.contains(&Position::new(49.5, 2.35)));
    }

    #[test]
    fn test_frame_text() {
        let mut registry = MarkerRegistry::new();
        registry.apply_update(ParticipantId::from("u2"), Position::new(48.86, 2.36));

        let mut map = view();
        assert!(map.render(&[]).to_text().contains("No travelers yet"));

        map.on_fix(Position::new(48.85, 2.35));
        let text = map.render(&registry.snapshot()).to_text();
        assert!(text.contains("My location: (48.85000, 2.35000)"));
        assert!(text.contains("Traveler u2"));
    }

    #[test]
    fn test_frame_json() {
        let mut registry = MarkerRegistry::new();
        registry.apply_update(ParticipantId::from("me"), Position::new(48.85, 2.35));

        let json = view().render(&registry.snapshot()).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["pins"][0]["label"], "You");
        assert_eq!(value["pins"][0]["color"], "primary");
        assert!(value["user_location"].is_null());
    }
}
