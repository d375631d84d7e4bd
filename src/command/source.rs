//! Where each cycle's command comes from

use super::codec::{self, Command};
use crate::config::CommandTemplate;

/// Supplies the next command to fire
///
/// Called on the worker pool, so implementations may block.
pub trait CommandSource: Send + Sync + 'static {
    fn next_command(&self) -> Command;
}

/// Produces the same synthetic command on every cycle
#[derive(Debug, Clone)]
pub struct FixedCommandSource {
    raw_name: String,
    payload: String,
    content_type: String,
}

impl FixedCommandSource {
    pub fn new(
        raw_name: impl Into<String>,
        payload: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            raw_name: raw_name.into(),
            payload: payload.into(),
            content_type: content_type.into(),
        }
    }
}

impl From<&CommandTemplate> for FixedCommandSource {
    fn from(template: &CommandTemplate) -> Self {
        Self::new(&template.name, &template.payload, &template.content_type)
    }
}

impl CommandSource for FixedCommandSource {
    fn next_command(&self) -> Command {
        codec::parse(&self.raw_name, &self.payload, &self.content_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_template_is_two_way_test_command() {
        let source = FixedCommandSource::from(&CommandTemplate::default());
        let cmd = source.next_command();
        assert_eq!(cmd.name(), "MQTTTestCommand");
        assert!(!cmd.is_one_way());
        assert_eq!(cmd.payload().as_ref(), br#"{"temperature":21}"#);
        assert_eq!(cmd.content_type(), "application/json");
    }

    #[test]
    fn test_repeats_identical_commands() {
        let source = FixedCommandSource::new("ow:reset", "{}", "application/json");
        assert_eq!(source.next_command(), source.next_command());
        assert!(source.next_command().is_one_way());
    }
}
