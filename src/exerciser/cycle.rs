//! Dispatch cycle state machine
//!
//! Tracks one command exchange at a time and which reconnect epoch it belongs
//! to. Completions carrying an epoch other than the current one are rejected,
//! so a straggler from before a reconnect cannot drive the new epoch.

use std::fmt;

/// One period of connectivity, as numbered by the exerciser
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(u64);

impl Epoch {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch {}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    /// Waiting for the next command
    Idle,
    /// A request handle is open and the command is on the wire
    Dispatching,
    Succeeded,
    Failed,
}

/// Events that can trigger state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleEvent {
    /// A command was produced and handed to the transport
    Dispatched,
    /// The send was acknowledged or the response arrived
    Succeeded,
    /// Send error, timeout or rejection
    Failed,
    /// Outcome handled and handle closed
    Settled,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was valid and state changed
    Success(CycleState),
    /// Transition was invalid from current state
    Invalid { from: CycleState, event: CycleEvent },
    /// The event belongs to a superseded epoch and was ignored
    Stale { epoch: Epoch, current: Epoch },
}

impl TransitionResult {
    pub fn is_stale(&self) -> bool {
        matches!(self, TransitionResult::Stale { .. })
    }
}

#[derive(Debug)]
pub struct CycleStateMachine {
    state: CycleState,
    epoch: Epoch,
}

impl Default for CycleStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleStateMachine {
    /// Idle, before any connection (epoch 0)
    pub fn new() -> Self {
        Self {
            state: CycleState::Idle,
            epoch: Epoch(0),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Start a new epoch after a (re)connect; the machine restarts from Idle
    pub fn begin_epoch(&mut self) -> Epoch {
        self.epoch = Epoch(self.epoch.0 + 1);
        self.state = CycleState::Idle;
        self.epoch
    }

    /// Process an event raised by work started in `epoch`
    pub fn process_event(&mut self, epoch: Epoch, event: CycleEvent) -> TransitionResult {
        if epoch != self.epoch {
            return TransitionResult::Stale {
                epoch,
                current: self.epoch,
            };
        }

        let next = match (self.state, event) {
            (CycleState::Idle, CycleEvent::Dispatched) => CycleState::Dispatching,
            (CycleState::Dispatching, CycleEvent::Succeeded) => CycleState::Succeeded,
            (CycleState::Dispatching, CycleEvent::Failed) => CycleState::Failed,
            (CycleState::Succeeded | CycleState::Failed, CycleEvent::Settled) => CycleState::Idle,
            (from, event) => return TransitionResult::Invalid { from, event },
        };

        self.state = next;
        TransitionResult::Success(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let fsm = CycleStateMachine::new();
        assert_eq!(fsm.state(), CycleState::Idle);
        assert_eq!(fsm.epoch().get(), 0);
    }

    #[test]
    fn test_success_cycle() {
        let mut fsm = CycleStateMachine::new();
        let epoch = fsm.begin_epoch();

        assert_eq!(
            fsm.process_event(epoch, CycleEvent::Dispatched),
            TransitionResult::Success(CycleState::Dispatching)
        );
        assert_eq!(
            fsm.process_event(epoch, CycleEvent::Succeeded),
            TransitionResult::Success(CycleState::Succeeded)
        );
        assert_eq!(
            fsm.process_event(epoch, CycleEvent::Settled),
            TransitionResult::Success(CycleState::Idle)
        );
    }

    #[test]
    fn test_failure_cycle_returns_to_idle() {
        let mut fsm = CycleStateMachine::new();
        let epoch = fsm.begin_epoch();

        fsm.process_event(epoch, CycleEvent::Dispatched);
        assert_eq!(
            fsm.process_event(epoch, CycleEvent::Failed),
            TransitionResult::Success(CycleState::Failed)
        );
        fsm.process_event(epoch, CycleEvent::Settled);
        assert_eq!(fsm.state(), CycleState::Idle);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut fsm = CycleStateMachine::new();
        let epoch = fsm.begin_epoch();

        // Nothing in flight yet
        let result = fsm.process_event(epoch, CycleEvent::Succeeded);
        assert!(matches!(result, TransitionResult::Invalid { from: CycleState::Idle, .. }));

        // No second dispatch while one is in flight
        fsm.process_event(epoch, CycleEvent::Dispatched);
        let result = fsm.process_event(epoch, CycleEvent::Dispatched);
        assert!(matches!(
            result,
            TransitionResult::Invalid {
                from: CycleState::Dispatching,
                event: CycleEvent::Dispatched
            }
        ));
        assert_eq!(fsm.state(), CycleState::Dispatching);
    }

    #[test]
    fn test_reconnect_invalidates_in_flight_completion() {
        let mut fsm = CycleStateMachine::new();
        let first = fsm.begin_epoch();
        fsm.process_event(first, CycleEvent::Dispatched);

        let second = fsm.begin_epoch();
        assert_eq!(fsm.state(), CycleState::Idle);

        let result = fsm.process_event(first, CycleEvent::Succeeded);
        assert!(result.is_stale());
        assert_eq!(
            result,
            TransitionResult::Stale {
                epoch: first,
                current: second
            }
        );
        assert_eq!(fsm.state(), CycleState::Idle);

        // The new epoch runs normally
        assert_eq!(
            fsm.process_event(second, CycleEvent::Dispatched),
            TransitionResult::Success(CycleState::Dispatching)
        );
    }

    #[test]
    fn test_epochs_increase() {
        let mut fsm = CycleStateMachine::new();
        let a = fsm.begin_epoch();
        let b = fsm.begin_epoch();
        assert!(b > a);
        assert_eq!(b.to_string(), "epoch 2");
    }
}
