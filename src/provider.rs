//! Concrete collaborators the service wires into the engine.

use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use dashmap::DashMap;
use rand::Rng;
use realtime::{GeoPoint, RecordStore, RouteSource, UnitLocation, bad_gateway};
use reqwest::Url;
use serde::{Deserialize, Serialize};

const KM_PER_DEGREE_LAT: f64 = 111.32;

/// Durable record service reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRecords {
    client: reqwest::Client,
    base_url: Url,
}

#[derive(Debug, Serialize, Deserialize)]
struct UnitLocationRecord {
    unit_id: String,
    #[serde(flatten)]
    location: UnitLocation,
}

impl HttpRecords {
    /// # Errors
    ///
    /// Returns an error when `base_url` is not an absolute http(s) URL or the
    /// client cannot be built.
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url =
            Url::parse(base_url).with_context(|| format!("invalid records url {base_url}"))?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("records url {base_url} cannot be a base"));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build http client")?;
        Ok(Self { client, base_url })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("records url cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

impl RecordStore for HttpRecords {
    async fn upsert_location(&self, unit_id: &str, location: &UnitLocation) -> Result<()> {
        let url = self.url(&["units", unit_id, "location"])?;
        let response = self
            .client
            .put(url)
            .json(location)
            .send()
            .await
            .with_context(|| format!("failed to send location for {unit_id}"))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(bad_gateway!("records service returned {status} for {unit_id}").into());
        }
        Ok(())
    }

    async fn locations(&self) -> Result<Vec<(String, UnitLocation)>> {
        let url = self.url(&["units", "locations"])?;
        let response = self.client.get(url).send().await.context("failed to fetch unit locations")?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(bad_gateway!("records service returned {status} for unit locations").into());
        }

        let records: Vec<UnitLocationRecord> =
            response.json().await.context("failed to parse unit locations")?;
        Ok(records.into_iter().map(|record| (record.unit_id, record.location)).collect())
    }
}

/// The durable store selected at start-up.
#[derive(Debug, Clone)]
pub enum Records {
    Http(HttpRecords),
    Memory(MemoryRecords),
}

impl RecordStore for Records {
    async fn upsert_location(&self, unit_id: &str, location: &UnitLocation) -> Result<()> {
        match self {
            Self::Http(records) => records.upsert_location(unit_id, location).await,
            Self::Memory(records) => records.upsert_location(unit_id, location).await,
        }
    }

    async fn locations(&self) -> Result<Vec<(String, UnitLocation)>> {
        match self {
            Self::Http(records) => records.locations().await,
            Self::Memory(records) => records.locations().await,
        }
    }
}

/// In-process record store used when no records service is configured.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecords {
    locations: Arc<DashMap<String, UnitLocation>>,
}

impl MemoryRecords {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, unit_id: &str) -> Option<UnitLocation> {
        self.locations.get(unit_id).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.locations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

impl RecordStore for MemoryRecords {
    async fn upsert_location(&self, unit_id: &str, location: &UnitLocation) -> Result<()> {
        self.locations.insert(unit_id.to_string(), location.clone());
        Ok(())
    }

    async fn locations(&self) -> Result<Vec<(String, UnitLocation)>> {
        let mut locations: Vec<(String, UnitLocation)> = self
            .locations
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        locations.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(locations)
    }
}

/// Synthesises patrol loops as a jittered ring of waypoints around the start.
#[derive(Debug, Clone, Copy)]
pub struct LoopRoutes {
    waypoints: usize,
    radius_km: f64,
}

impl LoopRoutes {
    #[must_use]
    pub fn new(waypoints: usize, radius_km: f64) -> Self {
        Self { waypoints: waypoints.max(1), radius_km }
    }
}

impl RouteSource for LoopRoutes {
    async fn patrol_route(&self, start: GeoPoint) -> Result<Vec<GeoPoint>> {
        Ok(ring(start, self.waypoints, self.radius_km, &mut rand::thread_rng()))
    }
}

fn ring(start: GeoPoint, waypoints: usize, radius_km: f64, rng: &mut impl Rng) -> Vec<GeoPoint> {
    let step = TAU / waypoints as f64;
    (0..waypoints)
        .map(|i| {
            let bearing = step.mul_add(i as f64, rng.gen_range(-0.25..=0.25) * step);
            let distance = radius_km * rng.gen_range(0.7..=1.0);
            offset(start, bearing, distance)
        })
        .collect()
}

// flat-earth offset, accurate enough over a few kilometres
fn offset(start: GeoPoint, bearing: f64, distance_km: f64) -> GeoPoint {
    let d_lat = distance_km * bearing.cos() / KM_PER_DEGREE_LAT;
    let km_per_degree_lng = KM_PER_DEGREE_LAT * start.lat.to_radians().cos().max(0.01);
    let d_lng = distance_km * bearing.sin() / km_per_degree_lng;

    let lng = start.lng + d_lng;
    GeoPoint {
        lat: (start.lat + d_lat).clamp(-90.0, 90.0),
        lng: if lng > 180.0 { lng - 360.0 } else if lng < -180.0 { lng + 360.0 } else { lng },
    }
}
