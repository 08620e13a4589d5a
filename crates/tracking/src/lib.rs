//! Real-time unit location tracking and synchronization engine.
//!
//! Position reports land in the [`PositionStore`], a last-value-wins register
//! per unit that fans every update out to live subscribers. The
//! [`SyncService`] periodically folds the live state into a durable
//! [`RecordStore`](realtime::RecordStore), the [`ProximityIndex`] answers
//! radius queries against it, the [`Simulator`] drives moving units through
//! the same write path and the [`StreamGateway`] forwards a unit's updates to
//! remote clients.

pub mod config;
pub mod fanout;
pub mod gateway;
pub mod locks;
pub mod position;
pub mod proximity;
pub mod simulator;
pub mod store;
pub mod sync;

pub use config::*;
pub use fanout::{Fanout, Subscription};
pub use gateway::{CloseReason, SessionState, StreamGateway, StreamSession, UpdateSink};
pub use position::{Position, PositionRecord};
pub use proximity::{NearbyUnit, ProximityIndex, haversine_km, initial_bearing};
pub use realtime::{Error, GeoPoint, Result};
pub use simulator::{RoutePlan, Simulator};
pub use store::PositionStore;
pub use sync::{CycleOutcome, CycleReport, SyncCheckpoint, SyncService, SyncState, SyncStats};
