//! Connection management for multiple strip peers
//!
//! This module handles:
//! - One supervised session per peer with automatic reconnection
//! - Linear reconnect backoff, reset once a peer is ready
//! - Heartbeat probes to every ready peer
//! - Reconnecting every open peer when the radio comes back on

mod manager;
mod session;

pub use manager::{LinkConfig, StripEvent, StripManager};
