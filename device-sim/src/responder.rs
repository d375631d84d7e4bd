//! Builds the device's replies

use commander_shared::{
    envelope::Payload, Ack, CommandRequest, CommandResponse, Envelope, Header, MessageType,
};
use tracing::{debug, info};

/// Reply for one incoming envelope; None when there is nothing to answer
pub fn reply(envelope: &Envelope) -> Option<Envelope> {
    let Some(header) = &envelope.header else {
        debug!("Dropping envelope without header");
        return None;
    };

    match &envelope.payload {
        Some(Payload::Request(request)) if request.one_way => {
            info!(
                "[{}:{}] id={} one-way '{}' accepted",
                header.tenant_id, header.device_id, header.correlation_id, request.name
            );
            Some(Envelope::ack(
                Header::reply_to(header, MessageType::MsgAck),
                Ack::accepted(),
            ))
        }
        Some(Payload::Request(request)) => {
            info!(
                "[{}:{}] id={} command '{}' ({} bytes, {})",
                header.tenant_id,
                header.device_id,
                header.correlation_id,
                request.name,
                request.payload.len(),
                request.content_type
            );
            Some(Envelope::response(
                Header::reply_to(header, MessageType::MsgResponse),
                respond(request),
            ))
        }
        Some(other) => {
            debug!("id={} unexpected payload {:?}", header.correlation_id, other);
            None
        }
        None => {
            debug!("id={} envelope without payload", header.correlation_id);
            None
        }
    }
}

fn respond(request: &CommandRequest) -> CommandResponse {
    let body = format!(r#"{{"command":"{}","result":"ok"}}"#, escape(&request.name));
    CommandResponse::ok(Some(body.into_bytes()), "application/json")
}

/// Minimal JSON string escaping for command names
fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}
