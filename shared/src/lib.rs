//! Command Exerciser Shared Protocol Types
//!
//! This crate provides the wire messages and framing codec spoken between the
//! exerciser and the device endpoint it drives.

pub mod codec;

use std::time::{SystemTime, UNIX_EPOCH};

/// Protobuf messages, declared with `prost` derives instead of a build step
pub mod proto {
    /// Routing and correlation metadata carried by every envelope
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Header {
        #[prost(string, tag = "1")]
        pub tenant_id: String,
        #[prost(string, tag = "2")]
        pub device_id: String,
        #[prost(uint64, tag = "3")]
        pub correlation_id: u64,
        #[prost(uint64, tag = "4")]
        pub timestamp_ms: u64,
        #[prost(enumeration = "MessageType", tag = "5")]
        pub msg_type: i32,
    }

    /// A command addressed to a device
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct CommandRequest {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(string, tag = "2")]
        pub content_type: String,
        #[prost(bytes = "vec", tag = "3")]
        pub payload: Vec<u8>,
        #[prost(bool, tag = "4")]
        pub one_way: bool,
    }

    /// Reply to a two-way command
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct CommandResponse {
        #[prost(uint32, tag = "1")]
        pub status: u32,
        #[prost(bytes = "vec", optional, tag = "2")]
        pub payload: Option<Vec<u8>>,
        #[prost(string, tag = "3")]
        pub content_type: String,
        #[prost(string, tag = "4")]
        pub error_message: String,
    }

    /// Delivery confirmation for a one-way command
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Ack {
        #[prost(bool, tag = "1")]
        pub accepted: bool,
        #[prost(string, tag = "2")]
        pub message: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Envelope {
        #[prost(message, optional, tag = "1")]
        pub header: Option<Header>,
        #[prost(oneof = "envelope::Payload", tags = "2, 3, 4")]
        pub payload: Option<envelope::Payload>,
    }

    pub mod envelope {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Payload {
            #[prost(message, tag = "2")]
            Request(super::CommandRequest),
            #[prost(message, tag = "3")]
            Response(super::CommandResponse),
            #[prost(message, tag = "4")]
            Ack(super::Ack),
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum MessageType {
        MsgUnknown = 0,
        MsgRequest = 1,
        MsgResponse = 2,
        MsgAck = 3,
    }
}

// Re-export commonly used types at crate root
pub use proto::*;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Protocol defaults shared by the exerciser and the device simulator
pub mod defaults {
    /// Tenant the exerciser addresses
    pub const TENANT_ID: &str = "DEFAULT_TENANT";

    /// Device the exerciser addresses
    pub const DEVICE_ID: &str = "4711";

    /// Per-request timeout in milliseconds
    pub const REQUEST_TIMEOUT_MS: u64 = 5000;

    /// Size of the pool producing commands
    pub const WORKER_POOL_SIZE: usize = 3;

    /// Default device endpoint
    pub const SERVER_ADDR: &str = "127.0.0.1:8080";

    /// Response status range treated as success
    pub const STATUS_OK: u32 = 200;
}

impl Header {
    /// Create a header addressed to a tenant/device pair
    pub fn new(
        tenant_id: impl Into<String>,
        device_id: impl Into<String>,
        correlation_id: u64,
        msg_type: MessageType,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            device_id: device_id.into(),
            correlation_id,
            timestamp_ms: now_ms(),
            msg_type: msg_type.into(),
        }
    }

    /// Header for a reply, echoing the request's routing and correlation id
    pub fn reply_to(request: &Header, msg_type: MessageType) -> Self {
        Self::new(
            request.tenant_id.clone(),
            request.device_id.clone(),
            request.correlation_id,
            msg_type,
        )
    }
}

impl CommandResponse {
    /// A successful response carrying an optional payload
    pub fn ok(payload: Option<Vec<u8>>, content_type: impl Into<String>) -> Self {
        Self {
            status: defaults::STATUS_OK,
            payload,
            content_type: content_type.into(),
            error_message: String::new(),
        }
    }

    /// A failed response with the given status
    pub fn error(status: u32, message: impl Into<String>) -> Self {
        Self {
            status,
            payload: None,
            content_type: String::new(),
            error_message: message.into(),
        }
    }

    /// Whether the status lies in the 2xx range
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl Ack {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            message: String::new(),
        }
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            message: message.into(),
        }
    }
}

impl Envelope {
    /// Wrap a command request
    pub fn request(header: Header, request: CommandRequest) -> Self {
        Self {
            header: Some(header),
            payload: Some(envelope::Payload::Request(request)),
        }
    }

    /// Wrap a command response
    pub fn response(header: Header, response: CommandResponse) -> Self {
        Self {
            header: Some(header),
            payload: Some(envelope::Payload::Response(response)),
        }
    }

    /// Wrap an ack
    pub fn ack(header: Header, ack: Ack) -> Self {
        Self {
            header: Some(header),
            payload: Some(envelope::Payload::Ack(ack)),
        }
    }

    /// Correlation id from the header, if present
    pub fn correlation_id(&self) -> Option<u64> {
        self.header.as_ref().map(|h| h.correlation_id)
    }
}
