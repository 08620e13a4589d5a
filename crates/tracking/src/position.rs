//! Position reports and the records the store keeps for each unit.

use chrono::{DateTime, Utc};
use realtime::{Error, GeoPoint, Result, bad_request};
use serde::{Deserialize, Serialize};

/// The latest known position of a unit. One per unit, overwritten in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub unit_id: String,
    pub lat: f64,
    pub lng: f64,
    pub speed: f64,
    pub heading: f64,
    pub observed_at: DateTime<Utc>,
}

impl PositionRecord {
    #[must_use]
    pub const fn point(&self) -> GeoPoint {
        GeoPoint { lat: self.lat, lng: self.lng }
    }
}

/// An inbound position report.
///
/// Speed and heading default to zero. A missing `observed_at` is stamped by
/// the store when the report is written.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
}

impl Position {
    #[must_use]
    pub const fn at(point: GeoPoint) -> Self {
        Self { lat: point.lat, lng: point.lng, speed: None, heading: None, observed_at: None }
    }

    #[must_use]
    pub const fn with_motion(mut self, speed: f64, heading: f64) -> Self {
        self.speed = Some(speed);
        self.heading = Some(heading);
        self
    }

    /// Rejects malformed reports and normalises the heading into `[0, 360)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadRequest`] for out of range coordinates, a negative
    /// or non-finite speed, or a non-finite heading.
    pub fn validate(self) -> Result<Self> {
        GeoPoint { lat: self.lat, lng: self.lng }.validate()?;

        if let Some(speed) = self.speed
            && (!speed.is_finite() || speed < 0.0)
        {
            return Err(bad_request!("speed {speed} must be a non-negative number"));
        }
        let heading = match self.heading {
            Some(heading) if !heading.is_finite() => {
                return Err(bad_request!("heading {heading} must be a finite number"));
            }
            Some(heading) => Some(normalize_heading(heading)),
            None => None,
        };

        Ok(Self { heading, ..self })
    }

    pub(crate) fn into_record(self, unit_id: &str) -> PositionRecord {
        PositionRecord {
            unit_id: unit_id.to_string(),
            lat: self.lat,
            lng: self.lng,
            speed: self.speed.unwrap_or_default(),
            heading: self.heading.map_or(0.0, normalize_heading),
            observed_at: self.observed_at.unwrap_or_else(Utc::now),
        }
    }
}

/// Checks a unit identifier and returns it trimmed.
///
/// # Errors
///
/// Returns [`Error::BadRequest`] when the identifier is blank.
pub fn validate_unit_id(unit_id: &str) -> Result<&str> {
    let trimmed = unit_id.trim();
    if trimmed.is_empty() {
        return Err(Error::BadRequest("unit id must not be empty".to_string()));
    }
    Ok(trimmed)
}

/// Maps any finite angle in degrees into `[0, 360)`.
#[must_use]
pub fn normalize_heading(degrees: f64) -> f64 {
    let heading = degrees.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs
    if heading >= 360.0 { 0.0 } else { heading }
}
