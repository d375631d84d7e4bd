//! Session handling for connected exercisers
//!
//! This module handles:
//! - Framed reads from one TCP connection
//! - A shared write side for replies sent from spawned tasks

mod connection;

pub use connection::{DeviceSession, SessionHandle};
