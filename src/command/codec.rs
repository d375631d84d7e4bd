//! Raw command line -> typed command

use bytes::Bytes;

/// Marker on a raw command name requesting fire-and-forget delivery
pub const ONE_WAY_PREFIX: &str = "ow:";

/// A command ready for dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    payload: Bytes,
    content_type: String,
    one_way: bool,
}

impl Command {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn is_one_way(&self) -> bool {
        self.one_way
    }
}

/// Parse a raw command name plus its payload and content type
///
/// Never fails: the payload is carried opaquely and any name is accepted.
pub fn parse(raw: &str, payload: &str, content_type: &str) -> Command {
    let (name, one_way) = match raw.strip_prefix(ONE_WAY_PREFIX) {
        Some(rest) => (rest, true),
        None => (raw, false),
    };

    Command {
        name: name.to_owned(),
        payload: Bytes::copy_from_slice(payload.as_bytes()),
        content_type: content_type.to_owned(),
        one_way,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_way_prefix_stripped() {
        let cmd = parse("ow:reset", "{}", "application/json");
        assert_eq!(cmd.name(), "reset");
        assert!(cmd.is_one_way());
        assert_eq!(cmd.payload().as_ref(), b"{}");
        assert_eq!(cmd.content_type(), "application/json");
    }

    #[test]
    fn test_two_way_name_unchanged() {
        let cmd = parse("MQTTTestCommand", r#"{"temperature":21}"#, "application/json");
        assert_eq!(cmd.name(), "MQTTTestCommand");
        assert!(!cmd.is_one_way());
        assert_eq!(cmd.payload().as_ref(), br#"{"temperature":21}"#);
    }

    #[test]
    fn test_prefix_must_lead() {
        for raw in ["reset:ow:", "OW:reset", " ow:reset", "o", "ow", "w:x"] {
            let cmd = parse(raw, "", "");
            assert!(!cmd.is_one_way(), "{raw:?} should be two-way");
            assert_eq!(cmd.name(), raw);
        }
    }

    #[test]
    fn test_only_first_prefix_removed() {
        let cmd = parse("ow:ow:double", "", "");
        assert!(cmd.is_one_way());
        assert_eq!(cmd.name(), "ow:double");
    }

    #[test]
    fn test_empty_inputs_accepted() {
        let cmd = parse("", "", "");
        assert_eq!(cmd.name(), "");
        assert!(!cmd.is_one_way());
        assert!(cmd.payload().is_empty());

        let bare = parse("ow:", "", "");
        assert!(bare.is_one_way());
        assert_eq!(bare.name(), "");
    }

    #[test]
    fn test_payload_is_opaque() {
        let cmd = parse("cmd", "not json at all \u{0}\u{7f}", "text/x-anything");
        assert_eq!(cmd.payload().as_ref(), "not json at all \u{0}\u{7f}".as_bytes());
        assert_eq!(cmd.content_type(), "text/x-anything");
    }
}
