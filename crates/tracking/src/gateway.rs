//! # Streaming Gateway
//!
//! Adapts a unit's fanout subscription into a per-client stream. A session
//! forwards every delivered [`PositionRecord`] to its [`UpdateSink`] as a
//! full-state message until the client goes away, the session or gateway is
//! cancelled, the unit is removed, or a send fails. The subscription is always
//! released when the session ends.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use realtime::Result;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::fanout::{Fanout, Subscription};
use crate::position::{PositionRecord, validate_unit_id};

/// The outbound half of a client connection.
pub trait UpdateSink: Send {
    /// Delivers one update. An error ends the session.
    fn send(&mut self, record: &PositionRecord) -> impl Future<Output = anyhow::Result<()>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Subscribed,
    Streaming,
    Idle,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    RemoteDisconnect,
    Cancelled,
    ChannelClosed,
    SendFailed,
}

#[derive(Debug, Clone)]
pub struct StreamGateway {
    fanout: Fanout,
    active: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl StreamGateway {
    /// Creates a gateway whose sessions all end when `shutdown` is cancelled.
    #[must_use]
    pub fn new(fanout: Fanout, shutdown: &CancellationToken) -> Self {
        Self { fanout, active: Arc::new(AtomicUsize::new(0)), shutdown: shutdown.child_token() }
    }

    /// Opens a session for `unit_id`. Succeeds whether or not the unit has
    /// reported yet; the session sees every update published from now on.
    ///
    /// # Errors
    ///
    /// Returns [`realtime::Error::BadRequest`] for a blank unit id.
    pub fn connect(&self, unit_id: &str) -> Result<StreamSession> {
        let unit_id = validate_unit_id(unit_id)?;
        let mut session = StreamSession {
            id: Uuid::new_v4(),
            unit_id: unit_id.to_string(),
            state: SessionState::Connecting,
            subscription: self.fanout.subscribe(unit_id),
            token: self.shutdown.child_token(),
            active: Arc::clone(&self.active),
            delivered: 0,
        };
        session.state = SessionState::Subscribed;
        self.active.fetch_add(1, Ordering::AcqRel);

        debug!(session_id = %session.id, unit_id = %unit_id, "stream session subscribed");
        Ok(session)
    }

    /// Number of sessions currently open.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// One client's stream of a single unit's updates.
#[derive(Debug)]
pub struct StreamSession {
    id: Uuid,
    unit_id: String,
    state: SessionState,
    subscription: Subscription,
    token: CancellationToken,
    active: Arc<AtomicUsize>,
    delivered: u64,
}

impl StreamSession {
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Token that ends this session alone when cancelled.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Forwards updates to `sink` until the session ends. `remote_closed`
    /// resolves when the client disconnects.
    pub async fn run<K, F>(mut self, sink: &mut K, remote_closed: F) -> CloseReason
    where
        K: UpdateSink,
        F: Future<Output = ()>,
    {
        info!(session_id = %self.id, unit_id = %self.unit_id, "stream session started");
        tokio::pin!(remote_closed);

        let reason = loop {
            self.state = SessionState::Idle;
            let record = tokio::select! {
                biased;

                () = self.token.cancelled() => break CloseReason::Cancelled,
                () = &mut remote_closed => break CloseReason::RemoteDisconnect,
                received = self.subscription.recv() => match received {
                    Some(record) => record,
                    None => break CloseReason::ChannelClosed,
                },
            };

            self.state = SessionState::Streaming;
            let sent = tokio::select! {
                biased;

                () = self.token.cancelled() => break CloseReason::Cancelled,
                sent = sink.send(&record) => sent,
            };
            if let Err(e) = sent {
                warn!(
                    session_id = %self.id, unit_id = %self.unit_id, error = %e,
                    "stream send failed"
                );
                break CloseReason::SendFailed;
            }
            self.delivered += 1;
        };

        self.state = SessionState::Closed;
        self.subscription.close();
        info!(
            session_id = %self.id,
            unit_id = %self.unit_id,
            ?reason,
            delivered = self.delivered,
            skipped = self.subscription.skipped(),
            "stream session closed"
        );
        reason
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use std::future::pending;

    use anyhow::bail;
    use realtime::GeoPoint;
    use tokio::sync::oneshot;

    use super::*;
    use crate::config::Config;
    use crate::position::Position;
    use crate::store::PositionStore;

    #[derive(Default)]
    struct VecSink(Vec<PositionRecord>);

    impl UpdateSink for VecSink {
        async fn send(&mut self, record: &PositionRecord) -> anyhow::Result<()> {
            self.0.push(record.clone());
            Ok(())
        }
    }

    struct BrokenSink;

    impl UpdateSink for BrokenSink {
        async fn send(&mut self, _: &PositionRecord) -> anyhow::Result<()> {
            bail!("connection reset")
        }
    }

    fn setup() -> (PositionStore, StreamGateway, CancellationToken) {
        let store = PositionStore::new(&Config::default());
        let shutdown = CancellationToken::new();
        let gateway = StreamGateway::new(store.fanout().clone(), &shutdown);
        (store, gateway, shutdown)
    }

    fn at(lat: f64) -> Position {
        Position::at(GeoPoint { lat, lng: -84.3880 })
    }

    #[tokio::test]
    async fn forwards_until_unit_removed() {
        let (store, gateway, _shutdown) = setup();
        let session = gateway.connect("U1").expect("should connect");
        assert_eq!(session.state(), SessionState::Subscribed);
        assert_eq!(gateway.active_sessions(), 1);

        store.put("U1", at(33.1));
        store.put("U2", at(10.0));
        store.put("U1", at(33.2));
        store.remove("U1");

        let mut sink = VecSink::default();
        let reason = session.run(&mut sink, pending()).await;

        assert_eq!(reason, CloseReason::ChannelClosed);
        let lats: Vec<f64> = sink.0.iter().map(|r| r.lat).collect();
        assert_eq!(lats, vec![33.1, 33.2]);
        assert_eq!(gateway.active_sessions(), 0);
        assert_eq!(store.fanout().subscriber_count("U1"), 0);
    }

    #[tokio::test]
    async fn remote_disconnect() {
        let (store, gateway, _shutdown) = setup();
        let session = gateway.connect("U1").expect("should connect");
        let (closed_tx, closed_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut sink = VecSink::default();
            let remote_closed = async move {
                let _ = closed_rx.await;
            };
            session.run(&mut sink, remote_closed).await
        });

        drop(closed_tx);
        let reason = task.await.expect("session task");

        assert_eq!(reason, CloseReason::RemoteDisconnect);
        assert_eq!(store.fanout().subscriber_count("U1"), 0);
        assert_eq!(gateway.active_sessions(), 0);
    }

    #[tokio::test]
    async fn gateway_shutdown_cancels_sessions() {
        let (_store, gateway, shutdown) = setup();
        let first = gateway.connect("U1").expect("should connect");
        let second = gateway.connect("U2").expect("should connect");

        shutdown.cancel();
        assert_eq!(first.run(&mut VecSink::default(), pending()).await, CloseReason::Cancelled);
        assert_eq!(second.run(&mut VecSink::default(), pending()).await, CloseReason::Cancelled);
        assert_eq!(gateway.active_sessions(), 0);
    }

    #[tokio::test]
    async fn failed_send_ends_session() {
        let (store, gateway, _shutdown) = setup();
        let session = gateway.connect("U1").expect("should connect");
        store.put("U1", at(33.1));

        assert_eq!(session.run(&mut BrokenSink, pending()).await, CloseReason::SendFailed);
        assert_eq!(store.fanout().subscriber_count("U1"), 0);
    }

    #[test]
    fn blank_unit_rejected() {
        let (_store, gateway, _shutdown) = setup();
        assert!(gateway.connect(" ").is_err());
        assert_eq!(gateway.active_sessions(), 0);
    }
}
