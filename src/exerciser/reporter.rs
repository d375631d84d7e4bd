//! Reporting of completed exchanges

use crate::transport::Outcome;
use tracing::{error, info};

/// Receives the outcome of every successful two-way command
pub trait ResponseReporter: Send + Sync {
    fn report(&self, outcome: &Outcome);
}

/// Response payload as text; an absent payload renders as the empty string
pub fn render(outcome: &Outcome) -> String {
    outcome
        .payload
        .as_deref()
        .map(|payload| String::from_utf8_lossy(payload).into_owned())
        .unwrap_or_default()
}

/// Writes responses to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ResponseReporter for LogReporter {
    fn report(&self, outcome: &Outcome) {
        if outcome.success {
            info!("Received command response: {}", render(outcome));
        } else {
            error!(
                "Command failed: {}",
                outcome.error_message.as_deref().unwrap_or("no error message")
            );
        }
    }
}
