//! Transport failure taxonomy

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    /// Could not establish the underlying connection
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("No response within {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The device answered, but not with success
    #[error("Rejected by device (status {status}): {message}")]
    Rejected { status: u32, message: String },

    #[error("Device refused one-way command: {0}")]
    Refused(String),

    /// The exchange completed but reported an unsuccessful outcome
    #[error("Command failed on device: {0}")]
    DeviceFailure(String),

    /// The connection dropped while the request was outstanding
    #[error("Connection lost before a reply arrived")]
    ConnectionLost,

    #[error("Transport is closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),
}
