//! The Position Store: a concurrent, last-value-wins register of the latest
//! position per unit with per-key expiry.
//!
//! Writes never fail and never wait on observers: `put` overwrites the unit's
//! entry under its shard lock, releases it and then hands the record to the
//! [`Fanout`]. Expiry is measured on the monotonic clock from the last `put`;
//! expired entries are invisible to readers straight away and are physically
//! removed lazily on read or by the background reaper.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::fanout::Fanout;
use crate::position::{Position, PositionRecord};

#[derive(Debug, Clone)]
pub struct PositionStore {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    records: DashMap<String, Entry>,
    fanout: Fanout,
    staleness_window: Duration,
    reap_interval: Duration,
}

#[derive(Debug, Clone)]
struct Entry {
    record: PositionRecord,
    refreshed_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.refreshed_at) >= window
    }
}

impl PositionStore {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self::with_fanout(config, Fanout::new(config.fanout_capacity))
    }

    #[must_use]
    pub fn with_fanout(config: &Config, fanout: Fanout) -> Self {
        Self {
            inner: Arc::new(Inner {
                records: DashMap::new(),
                fanout,
                staleness_window: config.staleness_window,
                reap_interval: config.reap_interval,
            }),
        }
    }

    /// Overwrites the unit's record and publishes it to the unit's
    /// subscribers. Returns the stored record.
    pub fn put(&self, unit_id: &str, position: Position) -> PositionRecord {
        let record = position.into_record(unit_id);
        let entry = Entry { record: record.clone(), refreshed_at: Instant::now() };

        // publish under the entry lock so subscribers see writes in store order
        let stored = self.inner.records.entry(unit_id.to_string()).insert(entry);
        self.inner.fanout.publish(&record);
        drop(stored);
        record
    }

    /// The latest record for the unit, or `None` when the unit never reported
    /// or its record expired.
    #[must_use]
    pub fn get(&self, unit_id: &str) -> Option<PositionRecord> {
        let now = Instant::now();
        let window = self.inner.staleness_window;
        {
            let entry = self.inner.records.get(unit_id)?;
            if !entry.is_expired(now, window) {
                return Some(entry.record.clone());
            }
        }
        self.inner.records.remove_if(unit_id, |_, entry| entry.is_expired(now, window));
        None
    }

    /// Snapshot of every live record, ordered by unit id. Entries written
    /// while the snapshot is taken may or may not be included.
    #[must_use]
    pub fn list_all(&self) -> Vec<PositionRecord> {
        let now = Instant::now();
        let window = self.inner.staleness_window;
        let mut records: Vec<PositionRecord> = self
            .inner
            .records
            .iter()
            .filter(|entry| !entry.is_expired(now, window))
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));
        records
    }

    /// Unregisters the unit: deletes its record and closes its fanout channel
    /// so live observers see the end of the stream. Returns the removed
    /// record if it was still live.
    pub fn remove(&self, unit_id: &str) -> Option<PositionRecord> {
        let now = Instant::now();
        let removed = self.inner.records.remove(unit_id);
        let closed = self.inner.fanout.close_unit(unit_id);
        debug!(unit_id = %unit_id, subscribers = closed, "unit removed");

        removed
            .filter(|(_, entry)| !entry.is_expired(now, self.inner.staleness_window))
            .map(|(_, entry)| entry.record)
    }

    #[must_use]
    pub fn contains(&self, unit_id: &str) -> bool {
        self.get(unit_id).is_some()
    }

    /// Number of stored entries, including expired ones not yet reaped.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.records.is_empty()
    }

    #[must_use]
    pub fn fanout(&self) -> &Fanout {
        &self.inner.fanout
    }

    #[must_use]
    pub fn staleness_window(&self) -> Duration {
        self.inner.staleness_window
    }

    /// One reaper pass. Each candidate is re-checked under its own shard lock
    /// so a unit refreshed mid-pass survives. Returns the number removed.
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let window = self.inner.staleness_window;

        let candidates: Vec<String> = self
            .inner
            .records
            .iter()
            .filter(|entry| entry.is_expired(now, window))
            .map(|entry| entry.key().clone())
            .collect();

        candidates
            .iter()
            .filter_map(|unit_id| {
                self.inner.records.remove_if(unit_id, |_, entry| entry.is_expired(now, window))
            })
            .count()
    }

    /// Runs the reaper every `reap_interval` until `shutdown` is cancelled.
    pub fn spawn_reaper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move { store.run_reaper(shutdown).await })
    }

    async fn run_reaper(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.inner.reap_interval.as_secs(),
            window_secs = self.inner.staleness_window.as_secs(),
            "position reaper starting"
        );

        let mut interval = tokio::time::interval(self.inner.reap_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // skip the first immediate tick
        interval.tick().await;

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    info!("position reaper shutting down");
                    break;
                }

                _ = interval.tick() => {
                    let reaped = self.reap_expired();
                    if reaped > 0 {
                        info!(
                            monotonic_counter.positions_expired = reaped as u64,
                            "expired stale positions"
                        );
                    }
                }
            }
        }
    }
}
