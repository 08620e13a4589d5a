//! # Realtime Core
//!
//! Error types and external collaborator interfaces shared by the tracking
//! engine and the service that hosts it.

mod error;
mod provider;

pub use crate::error::*;
pub use crate::provider::*;
