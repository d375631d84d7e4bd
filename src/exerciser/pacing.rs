//! Delay between dispatch cycles

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Strategy {
    Immediate,
    Fixed(Duration),
    Backoff { initial: Duration, max: Duration },
}

/// Decides how long to wait before the next cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pacing {
    strategy: Strategy,
    /// Last backoff delay handed out; cleared by a success
    current: Option<Duration>,
}

impl Default for Pacing {
    fn default() -> Self {
        Self::immediate()
    }
}

impl Pacing {
    /// No delay at all; the next cycle starts as soon as the previous one is handled
    pub fn immediate() -> Self {
        Self {
            strategy: Strategy::Immediate,
            current: None,
        }
    }

    pub fn fixed(interval: Duration) -> Self {
        Self {
            strategy: Strategy::Fixed(interval),
            current: None,
        }
    }

    /// No delay after successes; exponentially growing delay after consecutive failures
    pub fn backoff(initial: Duration, max: Duration) -> Self {
        Self {
            strategy: Strategy::Backoff {
                initial,
                max: max.max(initial),
            },
            current: None,
        }
    }

    /// Delay to apply after a cycle that ended in `succeeded`
    pub fn next_delay(&mut self, succeeded: bool) -> Duration {
        match self.strategy {
            Strategy::Immediate => Duration::ZERO,
            Strategy::Fixed(interval) => interval,
            Strategy::Backoff { initial, max } => {
                if succeeded {
                    self.current = None;
                    return Duration::ZERO;
                }
                let delay = match self.current {
                    Some(previous) => std::cmp::min(previous * 2, max),
                    None => initial,
                };
                self.current = Some(delay);
                delay
            }
        }
    }
}
