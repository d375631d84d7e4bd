//! Transport trait abstraction for pluggable messaging backends

use super::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::broadcast;

/// One period of connectivity to the messaging backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// 1 for the first successful connect, incremented on every reconnect
    pub epoch: u64,
    /// Remote address or endpoint description
    pub peer: String,
}

/// Result of a two-way exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub success: bool,
    pub payload: Option<Bytes>,
    pub error_message: Option<String>,
}

impl Outcome {
    pub fn success(payload: Option<Bytes>) -> Self {
        Self {
            success: true,
            payload,
            error_message: None,
        }
    }
}

/// A short-lived session scoped to a single command exchange
#[async_trait]
pub trait RequestHandle: Send {
    /// Bound on how long `send` waits for the reply
    fn set_timeout(&mut self, timeout: Duration);

    /// Fire a command without expecting a reply; resolves once delivery is acknowledged
    async fn send_one_way(
        &mut self,
        name: &str,
        content_type: &str,
        payload: Bytes,
    ) -> Result<(), TransportError>;

    /// Send a command and wait for the device's reply
    async fn send(
        &mut self,
        name: &str,
        content_type: &str,
        payload: Bytes,
    ) -> Result<Outcome, TransportError>;

    async fn close(&mut self);
}

/// The messaging client the exerciser drives
#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// Establish the first connection
    async fn connect(&self) -> Result<Connection, TransportError>;

    /// Notifications for every reconnect after the first connect
    ///
    /// Subscribe before calling `connect` so no reconnect is missed.
    fn reconnect_listener(&self) -> broadcast::Receiver<Connection>;

    /// Open a request session addressed to one device
    async fn request_client(
        &self,
        tenant_id: &str,
        device_id: &str,
    ) -> Result<Box<dyn RequestHandle>, TransportError>;

    /// Tear down the connection; pending requests fail
    async fn close(&self);
}
