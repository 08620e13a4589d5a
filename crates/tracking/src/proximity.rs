//! Radius queries over the live positions.

use realtime::{GeoPoint, Result, bad_request};
use serde::{Deserialize, Serialize};

use crate::position::PositionRecord;
use crate::store::PositionStore;

/// Earth's mean radius in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two points in kilometres (haversine).
#[must_use]
pub fn haversine_km(from: GeoPoint, to: GeoPoint) -> f64 {
    let lat1 = from.lat.to_radians();
    let lat2 = to.lat.to_radians();
    let d_lat = (to.lat - from.lat).to_radians();
    let d_lng = (to.lng - from.lng).to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    // clamp guards sqrt(1 - a) against rounding just above 1 near antipodes
    let a = a.clamp(0.0, 1.0);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Initial great-circle bearing from `from` towards `to`, in `[0, 360)`.
#[must_use]
pub fn initial_bearing(from: GeoPoint, to: GeoPoint) -> f64 {
    let lat1 = from.lat.to_radians();
    let lat2 = to.lat.to_radians();
    let d_lng = (to.lng - from.lng).to_radians();

    let x = d_lng.sin() * lat2.cos();
    let y = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * d_lng.cos();
    crate::position::normalize_heading(x.atan2(y).to_degrees())
}

/// A unit returned by a proximity query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyUnit {
    pub unit_id: String,
    pub lat: f64,
    pub lng: f64,
    pub speed: f64,
    pub heading: f64,
    pub distance_km: f64,
}

impl NearbyUnit {
    fn new(record: PositionRecord, distance_km: f64) -> Self {
        Self {
            unit_id: record.unit_id,
            lat: record.lat,
            lng: record.lng,
            speed: record.speed,
            heading: record.heading,
            distance_km,
        }
    }
}

/// Answers "which units are within R km of P" against a snapshot of the
/// store. Read-only.
#[derive(Debug, Clone)]
pub struct ProximityIndex {
    store: PositionStore,
}

impl ProximityIndex {
    #[must_use]
    pub const fn new(store: PositionStore) -> Self {
        Self { store }
    }

    /// Units within `radius_km` (inclusive) of the centre, nearest first.
    ///
    /// # Errors
    ///
    /// Returns [`realtime::Error::BadRequest`] for an invalid centre or a
    /// negative or non-finite radius.
    pub fn query(
        &self, center_lat: f64, center_lng: f64, radius_km: f64,
    ) -> Result<Vec<NearbyUnit>> {
        let center = GeoPoint::new(center_lat, center_lng)?;
        if !radius_km.is_finite() || radius_km < 0.0 {
            return Err(bad_request!("radius {radius_km} km must be a non-negative number"));
        }

        let mut nearby: Vec<NearbyUnit> = self
            .store
            .list_all()
            .into_iter()
            .filter_map(|record| {
                let distance_km = haversine_km(center, record.point());
                (distance_km <= radius_km).then(|| NearbyUnit::new(record, distance_km))
            })
            .collect();

        nearby.sort_by(|a, b| {
            a.distance_km.total_cmp(&b.distance_km).then_with(|| a.unit_id.cmp(&b.unit_id))
        });
        Ok(nearby)
    }
}
