//! Outpost Sync Server Library
//!
//! Real-time state synchronization for a multiplayer session: an
//! authoritative tick, a snapshot/delta broadcaster, and the client-side
//! prediction, reconciliation and interpolation that consume it.
//!
//! # Features
//!
//! - `client` - Client-side prediction, reconciliation and interpolation (enabled by default)

pub mod config;
pub mod game;
pub mod metrics;
pub mod net;
pub mod util;

#[cfg(feature = "client")]
pub mod client;
