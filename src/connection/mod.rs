//! Connection management for the device endpoint
//!
//! This module handles:
//! - Persistent TCP connection with automatic reconnection and backoff
//! - Reconnect epochs announced to listeners
//! - Correlating replies with the requests waiting for them

mod manager;

pub use manager::{ConnectionConfig, ConnectionManager, RequestLink};
