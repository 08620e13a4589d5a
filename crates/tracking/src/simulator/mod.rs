//! # Movement Simulator
//!
//! Drives simulated units around patrol loops, writing a position into the
//! store on every tick through the same path real reports take. Each unit
//! runs as its own cancellable task owned by the [`Simulator`] supervisor.

mod route;
mod unit;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use realtime::{Error, GeoPoint, RecordStore, Result, RouteSource, not_found};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use self::route::RoutePlan;
pub use self::unit::{Phase, SimulatedUnit, ease_in_out_cubic};
use crate::config::SimulatorConfig;
use crate::locks::KeyLocker;
use crate::position::{Position, PositionRecord, validate_unit_id};
use crate::store::PositionStore;

/// Supervisor for the per-unit simulation tasks.
#[derive(Debug)]
pub struct Simulator<S: RouteSource> {
    inner: Arc<Inner<S>>,
}

impl<S: RouteSource> Clone for Simulator<S> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

#[derive(Debug)]
struct Inner<S> {
    store: PositionStore,
    routes: Arc<S>,
    config: SimulatorConfig,
    units: Arc<DashMap<String, UnitHandle>>,
    locks: KeyLocker,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

#[derive(Debug)]
struct UnitHandle {
    generation: u64,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl UnitHandle {
    async fn stop(self, unit_id: &str) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!(unit_id = %unit_id, error = %e, "simulation task ended abnormally");
        }
    }
}

impl<S: RouteSource + 'static> Simulator<S> {
    /// Creates a supervisor whose unit tasks are all cancelled by `shutdown`.
    #[must_use]
    pub fn new(
        store: PositionStore, routes: Arc<S>, config: SimulatorConfig,
        shutdown: &CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                routes,
                config,
                units: Arc::new(DashMap::new()),
                locks: KeyLocker::new(),
                generation: AtomicU64::new(0),
                shutdown: shutdown.child_token(),
            }),
        }
    }

    /// Starts simulating `unit_id` from `start`, replacing any simulation
    /// already running for it. The start position is in the store when this
    /// returns.
    ///
    /// # Errors
    ///
    /// Returns [`realtime::Error::BadRequest`] for a blank unit id, an invalid
    /// start point or an explicit route with invalid waypoints, and
    /// [`realtime::Error::Internal`] once the simulator has been shut down.
    pub async fn add(
        &self, unit_id: &str, start: GeoPoint, plan: RoutePlan,
    ) -> Result<PositionRecord> {
        let unit_id = validate_unit_id(unit_id)?;
        start.validate()?;
        plan.validate()?;

        let _guard = self.inner.locks.lock(unit_id).await;
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::Internal(format!("simulator is shut down, cannot add {unit_id}")));
        }

        if let Some((_, previous)) = self.inner.units.remove(unit_id) {
            debug!(unit_id = %unit_id, "replacing running simulation");
            previous.stop(unit_id).await;
        }

        let record = self.inner.store.put(unit_id, Position::at(start).with_motion(0.0, 0.0));

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let token = self.inner.shutdown.child_token();
        let task = tokio::spawn({
            let unit_id = unit_id.to_string();
            let routes = Arc::clone(&self.inner.routes);
            let store = self.inner.store.clone();
            let config = self.inner.config.clone();
            let units = Arc::clone(&self.inner.units);
            let token = token.clone();
            async move {
                drive(&unit_id, start, plan, routes.as_ref(), store, config, &token).await;
                release(&units, &unit_id, generation);
            }
        });
        self.inner.units.insert(unit_id.to_string(), UnitHandle { generation, token, task });

        // a task cancelled before its entry went in has already tried to release it
        if self.inner.shutdown.is_cancelled() {
            release(&self.inner.units, unit_id, generation);
        }

        info!(unit_id = %unit_id, lat = start.lat, lng = start.lng, "simulated unit added");
        Ok(record)
    }

    /// Stops simulating `unit_id`. Once this returns no further position is
    /// written for the unit; its last position stays in the store.
    ///
    /// # Errors
    ///
    /// Returns [`realtime::Error::BadRequest`] for a blank unit id and
    /// [`realtime::Error::NotFound`] when the unit is not simulated.
    pub async fn remove(&self, unit_id: &str) -> Result<()> {
        let unit_id = validate_unit_id(unit_id)?;
        let _guard = self.inner.locks.lock(unit_id).await;

        let Some((_, handle)) = self.inner.units.remove(unit_id) else {
            return Err(not_found!("unit {unit_id} is not simulated"));
        };
        handle.stop(unit_id).await;

        info!(unit_id = %unit_id, "simulated unit removed");
        Ok(())
    }

    /// Ids of the simulated units, sorted.
    #[must_use]
    pub fn units(&self) -> Vec<String> {
        let mut units: Vec<String> =
            self.inner.units.iter().map(|entry| entry.key().clone()).collect();
        units.sort();
        units
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.units.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.units.is_empty()
    }

    #[must_use]
    pub fn is_simulated(&self, unit_id: &str) -> bool {
        self.inner.units.contains_key(unit_id.trim())
    }

    /// Cancels every unit task and waits for all of them to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let unit_ids = self.units();
        for unit_id in &unit_ids {
            let _guard = self.inner.locks.lock(unit_id.as_str()).await;
            if let Some((_, handle)) = self.inner.units.remove(unit_id) {
                handle.stop(unit_id).await;
            }
        }
        info!(stopped = unit_ids.len(), "simulator shut down");
    }

    /// A random point inside the configured bounds.
    #[must_use]
    pub fn random_start(&self) -> GeoPoint {
        let bounds = self.inner.config.bounds;
        let mut rng = rand::thread_rng();
        GeoPoint {
            lat: rng.gen_range(bounds.min.lat..=bounds.max.lat),
            lng: rng.gen_range(bounds.min.lng..=bounds.max.lng),
        }
    }

    /// Adds every unit the durable store knows about at its last durable
    /// location, with a synthesised route. Returns how many were added.
    ///
    /// # Errors
    ///
    /// Returns an error when the durable store cannot be read. Individual
    /// units with unusable locations are skipped.
    pub async fn seed_from_records<R: RecordStore>(&self, records: &R) -> Result<usize> {
        let locations = records.locations().await?;

        let mut added = 0;
        for (unit_id, location) in locations {
            let start = GeoPoint { lat: location.lat, lng: location.lng };
            match self.add(&unit_id, start, RoutePlan::Synthesize).await {
                Ok(_) => added += 1,
                Err(e) => {
                    warn!(unit_id = %unit_id, error = %e, "skipping unit with unusable location");
                }
            }
        }

        info!(added, "simulator seeded from durable records");
        Ok(added)
    }
}

async fn drive<S: RouteSource>(
    unit_id: &str, start: GeoPoint, plan: RoutePlan, routes: &S, store: PositionStore,
    config: SimulatorConfig, token: &CancellationToken,
) {
    let route = tokio::select! {
        biased;
        () = token.cancelled() => return,
        route = route::resolve(unit_id, start, plan, routes) => route,
    };
    debug!(unit_id = %unit_id, waypoints = route.len(), "simulation starting");

    let tick = config.tick;
    let mut unit = SimulatedUnit::new(start, route, config, StdRng::from_entropy(), Instant::now());

    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // the start position was written by `add`
    interval.tick().await;
    let mut last_tick = Instant::now();

    loop {
        tokio::select! {
            biased;

            () = token.cancelled() => break,

            now = interval.tick() => {
                let skipped = missed_ticks(now.saturating_duration_since(last_tick), tick);
                if skipped > 0 {
                    debug!(
                        unit_id = %unit_id,
                        monotonic_counter.simulator_ticks_skipped = skipped,
                        "simulator fell behind"
                    );
                }
                last_tick = now;
                store.put(unit_id, unit.step(now));
            }
        }
    }
    debug!(unit_id = %unit_id, "simulation stopped");
}

// Drops the unit's entry unless it already belongs to a replacement task.
fn release(units: &DashMap<String, UnitHandle>, unit_id: &str, generation: u64) {
    units.remove_if(unit_id, |_, handle| handle.generation == generation);
}

fn missed_ticks(gap: Duration, tick: Duration) -> u64 {
    let ticks = gap.as_nanos() / tick.as_nanos().max(1);
    u64::try_from(ticks.saturating_sub(1)).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missed_tick_count() {
        let tick = Duration::from_secs(1);
        assert_eq!(missed_ticks(Duration::from_millis(1000), tick), 0);
        assert_eq!(missed_ticks(Duration::from_millis(1999), tick), 0);
        assert_eq!(missed_ticks(Duration::from_secs(4), tick), 3);
        assert_eq!(missed_ticks(Duration::ZERO, tick), 0);
    }
}
