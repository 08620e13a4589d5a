//! # Provider
//!
//! Provider defines external data interfaces for the tracking engine: the
//! durable record store it synchronises into and the routing service it asks
//! for patrol routes.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, bad_request};

/// A point on the earth's surface in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    /// Creates a validated point.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadRequest`] when either coordinate is not finite or is
    /// outside `[-90, 90]` / `[-180, 180]`.
    pub fn new(lat: f64, lng: f64) -> Result<Self, Error> {
        let point = Self { lat, lng };
        point.validate()?;
        Ok(point)
    }

    /// Checks the coordinate ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadRequest`] describing the offending coordinate.
    pub fn validate(&self) -> Result<(), Error> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(bad_request!("latitude {} is outside [-90, 90]", self.lat));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(bad_request!("longitude {} is outside [-180, 180]", self.lng));
        }
        Ok(())
    }
}

/// The durable copy of a unit's location written by the sync service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitLocation {
    pub lat: f64,
    pub lng: f64,
    pub speed: f64,
    pub heading: f64,
    pub observed_at: DateTime<Utc>,

    /// Optional human readable annotation, e.g. "Moving at 32.5 mph".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The `RecordStore` trait defines the durable record system the live
/// positions are periodically folded into.
pub trait RecordStore: Send + Sync {
    /// Idempotently insert or replace the location of `unit_id`.
    fn upsert_location(
        &self, unit_id: &str, location: &UnitLocation,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Every unit the durable store knows a location for.
    fn locations(&self) -> impl Future<Output = Result<Vec<(String, UnitLocation)>>> + Send;
}

/// The `RouteSource` trait defines the routing collaborator used to obtain
/// patrol routes for simulated units.
pub trait RouteSource: Send + Sync {
    /// An ordered, closed-loop sequence of waypoints starting near `start`.
    fn patrol_route(&self, start: GeoPoint) -> impl Future<Output = Result<Vec<GeoPoint>>> + Send;
}

#[cfg(test)]
mod tests {
    use super::GeoPoint;
    use crate::Error;

    #[test]
    fn valid_point() {
        let point = GeoPoint::new(33.7490, -84.3880).expect("point should be valid");
        assert!((point.lat - 33.7490).abs() < f64::EPSILON);
    }

    #[test]
    fn bounds_are_inclusive() {
        assert!(GeoPoint::new(90.0, 180.0).is_ok());
        assert!(GeoPoint::new(-90.0, -180.0).is_ok());
    }

    #[test]
    fn out_of_range() {
        let Err(Error::BadRequest(msg)) = GeoPoint::new(91.0, 0.0) else {
            panic!("latitude should be rejected");
        };
        assert!(msg.contains("latitude"));

        let Err(Error::BadRequest(msg)) = GeoPoint::new(0.0, -180.5) else {
            panic!("longitude should be rejected");
        };
        assert!(msg.contains("longitude"));
    }

    #[test]
    fn not_finite() {
        assert!(GeoPoint::new(f64::NAN, 0.0).is_err());
        assert!(GeoPoint::new(0.0, f64::INFINITY).is_err());
    }
}
