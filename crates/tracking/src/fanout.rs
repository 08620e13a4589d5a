//! Publish/subscribe fanout of position updates.
//!
//! Every unit with at least one live subscriber owns a bounded broadcast
//! channel. Publishing never waits: a subscriber that falls more than
//! `capacity` updates behind loses its oldest undelivered updates and resumes
//! from the most recent ones, so the write path stays O(1) no matter how many
//! or how slow the subscribers are.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::debug;

use crate::position::PositionRecord;

#[derive(Debug, Clone)]
pub struct Fanout {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    channels: DashMap<String, broadcast::Sender<PositionRecord>>,
    capacity: usize,
}

impl Fanout {
    /// Creates a fanout whose per-unit channels buffer `capacity` updates
    /// (rounded up to a power of two).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { inner: Arc::new(Inner { channels: DashMap::new(), capacity: capacity.max(1) }) }
    }

    /// Subscribes to every subsequent update for `unit_id`.
    #[must_use]
    pub fn subscribe(&self, unit_id: &str) -> Subscription {
        let receiver = self
            .inner
            .channels
            .entry(unit_id.to_string())
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .subscribe();

        debug!(unit_id = %unit_id, "subscriber added");
        Subscription {
            unit_id: unit_id.to_string(),
            receiver: Some(receiver),
            skipped: 0,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Delivers `record` to every current subscriber of its unit.
    pub fn publish(&self, record: &PositionRecord) {
        let Some(sender) = self.inner.channels.get(&record.unit_id) else {
            return;
        };
        // only fails when the last receiver went away mid-publish
        let _ = sender.send(record.clone());
    }

    /// Closes the subscription. Idempotent.
    pub fn unsubscribe(&self, subscription: &mut Subscription) {
        subscription.close();
    }

    /// Drops the unit's channel. Subscribers drain what is already buffered
    /// and then observe the end of the stream. Returns how many subscribers
    /// were attached.
    pub fn close_unit(&self, unit_id: &str) -> usize {
        self.inner.channels.remove(unit_id).map_or(0, |(_, sender)| sender.receiver_count())
    }

    #[must_use]
    pub fn subscriber_count(&self, unit_id: &str) -> usize {
        self.inner.channels.get(unit_id).map_or(0, |sender| sender.receiver_count())
    }

    /// Number of units with at least one live channel.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }
}

/// One observer's delivery channel for one unit.
///
/// Dropping the subscription unsubscribes it.
#[derive(Debug)]
pub struct Subscription {
    unit_id: String,
    receiver: Option<broadcast::Receiver<PositionRecord>>,
    skipped: u64,
    inner: Arc<Inner>,
}

impl Subscription {
    #[must_use]
    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    /// Total updates this subscriber lost by falling behind.
    #[must_use]
    pub const fn skipped(&self) -> u64 {
        self.skipped
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.receiver.is_none()
    }

    /// Waits for the next update. Returns `None` once the subscription or the
    /// unit's channel has been closed.
    ///
    /// Cancel safe: an update is never lost by dropping the returned future.
    pub async fn recv(&mut self) -> Option<PositionRecord> {
        loop {
            let received = self.receiver.as_mut()?.recv().await;
            match received {
                Ok(record) => return Some(record),
                Err(RecvError::Lagged(skipped)) => self.lagged(skipped),
                Err(RecvError::Closed) => {
                    self.close();
                    return None;
                }
            }
        }
    }

    /// Returns the next buffered update without waiting.
    pub fn try_recv(&mut self) -> Option<PositionRecord> {
        loop {
            let received = self.receiver.as_mut()?.try_recv();
            match received {
                Ok(record) => return Some(record),
                Err(TryRecvError::Lagged(skipped)) => self.lagged(skipped),
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Closed) => {
                    self.close();
                    return None;
                }
            }
        }
    }

    /// Releases the channel. Idempotent.
    pub fn close(&mut self) {
        let Some(receiver) = self.receiver.take() else {
            return;
        };
        drop(receiver);
        self.inner.channels.remove_if(&self.unit_id, |_, sender| sender.receiver_count() == 0);
        debug!(unit_id = %self.unit_id, "subscriber removed");
    }

    fn lagged(&mut self, skipped: u64) {
        self.skipped += skipped;
        debug!(unit_id = %self.unit_id, skipped, "slow subscriber, dropped oldest updates");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
