//! Fleet tracker service: the HTTP and WebSocket surface over the
//! [`tracking`] engine plus the concrete collaborators it is wired to.

pub mod config;
pub mod http;
pub mod logging;
pub mod provider;

pub use crate::http::{AppState, router};
pub use crate::provider::{HttpRecords, LoopRoutes, MemoryRecords, Records};
