//! Periodic synchronisation of the live positions into the durable record
//! store.
//!
//! Each cycle snapshots the [`PositionStore`] and upserts every record. A
//! failing record is counted and retried implicitly by the next cycle; a
//! whole-store outage degrades a cycle into all-failures and the loop keeps
//! running.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream;
use realtime::{RecordStore, UnitLocation};
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::position::PositionRecord;
use crate::store::PositionStore;

/// Process-wide sync counters. Only the [`SyncService`] mutates them.
#[derive(Debug, Default)]
pub struct SyncCheckpoint {
    total_sync_cycles: AtomicU64,
    successful_upserts: AtomicU64,
    failed_upserts: AtomicU64,
    last_cycle_at: RwLock<Option<DateTime<Utc>>>,
}

/// Point-in-time copy of the [`SyncCheckpoint`] counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub total_sync_cycles: u64,
    pub successful_upserts: u64,
    pub failed_upserts: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

impl SyncCheckpoint {
    #[must_use]
    pub fn snapshot(&self) -> SyncStats {
        SyncStats {
            total_sync_cycles: self.total_sync_cycles.load(Ordering::Relaxed),
            successful_upserts: self.successful_upserts.load(Ordering::Relaxed),
            failed_upserts: self.failed_upserts.load(Ordering::Relaxed),
            last_cycle_at: self.last_cycle_at.read().map_or(None, |at| *at),
        }
    }

    fn record(&self, report: &CycleReport, finished_at: DateTime<Utc>) {
        self.successful_upserts.fetch_add(report.succeeded, Ordering::Relaxed);
        self.failed_upserts.fetch_add(report.failed, Ordering::Relaxed);
        if let Ok(mut last) = self.last_cycle_at.write() {
            *last = Some(finished_at);
        }
        self.total_sync_cycles.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleOutcome {
    Success,
    Failure,
}

/// Result of one sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CycleReport {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl CycleReport {
    /// A cycle succeeds when no record failed, including an empty cycle.
    #[must_use]
    pub const fn outcome(&self) -> CycleOutcome {
        if self.failed == 0 { CycleOutcome::Success } else { CycleOutcome::Failure }
    }
}

/// Folds the live positions into a [`RecordStore`] on a fixed period.
#[derive(Debug)]
pub struct SyncService<R: RecordStore> {
    store: PositionStore,
    records: Arc<R>,
    config: SyncConfig,
    checkpoint: Arc<SyncCheckpoint>,
    running: AtomicBool,
}

impl<R: RecordStore> SyncService<R> {
    #[must_use]
    pub fn new(store: PositionStore, records: Arc<R>, config: SyncConfig) -> Self {
        Self {
            store,
            records,
            config,
            checkpoint: Arc::new(SyncCheckpoint::default()),
            running: AtomicBool::new(false),
        }
    }

    /// Shared handle to the counters for monitoring.
    #[must_use]
    pub fn checkpoint(&self) -> Arc<SyncCheckpoint> {
        Arc::clone(&self.checkpoint)
    }

    #[must_use]
    pub fn state(&self) -> SyncState {
        if self.running.load(Ordering::Acquire) { SyncState::Running } else { SyncState::Idle }
    }

    /// Runs one cycle: snapshot, upsert every record, update the checkpoint.
    pub async fn run_cycle(&self) -> CycleReport {
        self.running.store(true, Ordering::Release);

        let snapshot = self.store.list_all();
        let mut report = CycleReport { attempted: snapshot.len() as u64, ..CycleReport::default() };

        let mut upserts = stream::iter(snapshot)
            .map(|record| self.upsert(record))
            .buffer_unordered(self.config.concurrency);
        while let Some(ok) = upserts.next().await {
            if ok {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }
        }
        drop(upserts);

        self.checkpoint.record(&report, Utc::now());
        self.running.store(false, Ordering::Release);

        if report.failed > 0 {
            warn!(
                monotonic_counter.sync_cycles = 1,
                monotonic_counter.upsert_failures = report.failed,
                attempted = report.attempted,
                "sync cycle finished with failures"
            );
        } else {
            debug!(
                monotonic_counter.sync_cycles = 1,
                attempted = report.attempted,
                "sync cycle finished"
            );
        }
        report
    }

    /// Runs a cycle every `interval` until `shutdown` is cancelled. An
    /// in-flight cycle is abandoned on cancellation.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(interval_secs = self.config.interval.as_secs(), "sync service starting");

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // skip the first immediate tick
        interval.tick().await;

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    info!("sync service shutting down");
                    break;
                }

                _ = interval.tick() => {
                    tokio::select! {
                        biased;
                        () = shutdown.cancelled() => {
                            self.running.store(false, Ordering::Release);
                            info!("sync service shutting down mid-cycle");
                            break;
                        }
                        _ = self.run_cycle() => {}
                    }
                }
            }
        }
    }

    async fn upsert(&self, record: PositionRecord) -> bool {
        let location = self.location(&record);
        let upsert = self.records.upsert_location(&record.unit_id, &location);

        match tokio::time::timeout(self.config.upsert_timeout, upsert).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(unit_id = %record.unit_id, error = %e, "failed to upsert unit location");
                false
            }
            Err(_) => {
                warn!(
                    unit_id = %record.unit_id,
                    timeout_secs = self.config.upsert_timeout.as_secs(),
                    "unit location upsert timed out"
                );
                false
            }
        }
    }

    fn location(&self, record: &PositionRecord) -> UnitLocation {
        let description = self
            .config
            .speed_annotation
            .then(|| format!("Moving at {:.1} mph", record.speed));

        UnitLocation {
            lat: record.lat,
            lng: record.lng,
            speed: record.speed,
            heading: record.heading,
            observed_at: record.observed_at,
            description,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome() {
        assert_eq!(CycleReport::default().outcome(), CycleOutcome::Success);
        let report = CycleReport { attempted: 3, succeeded: 2, failed: 1 };
        assert_eq!(report.outcome(), CycleOutcome::Failure);
    }

    #[test]
    fn checkpoint_accumulates() {
        let checkpoint = SyncCheckpoint::default();
        let now = Utc::now();
        checkpoint.record(&CycleReport { attempted: 2, succeeded: 2, failed: 0 }, now);
        checkpoint.record(&CycleReport { attempted: 2, succeeded: 1, failed: 1 }, now);

        let stats = checkpoint.snapshot();
        assert_eq!(stats.total_sync_cycles, 2);
        assert_eq!(stats.successful_upserts, 3);
        assert_eq!(stats.failed_upserts, 1);
        assert_eq!(stats.last_cycle_at, Some(now));
    }

    #[test]
    fn fresh_checkpoint_is_empty() {
        let stats = SyncCheckpoint::default().snapshot();
        assert_eq!(stats.total_sync_cycles, 0);
        assert!(stats.last_cycle_at.is_none());
    }
}
