//! Pump Lifecycle State Machine
//!
//! Defines the valid lifecycle transitions of a duplex message pump:
//! `Created -> Opening -> Active -> Closing -> Closed`.

use std::fmt;

/// Lifecycle state of a pump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PumpState {
    /// Built, `open` not yet requested
    Created,
    /// Dialing / handshaking
    Opening,
    /// Frames flow in both directions
    Active,
    /// Close requested or terminal condition seen, receive loop draining
    Closing,
    /// Receive loop exited and the backend has been disposed
    Closed,
}

impl PumpState {
    /// True once no further transitions are possible
    pub fn is_terminal(self) -> bool {
        self == PumpState::Closed
    }
}

impl fmt::Display for PumpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PumpState::Created => "created",
            PumpState::Opening => "opening",
            PumpState::Active => "active",
            PumpState::Closing => "closing",
            PumpState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Events that can trigger state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEvent {
    /// `open` was invoked on the backend
    OpenStarted,
    /// `open` completed successfully
    Opened,
    /// `open` failed or was cancelled
    OpenFailed,
    /// Close requested by the engine or by cancellation
    CloseRequested,
    /// Receive loop hit a terminal condition (remote close, transport fault)
    ReceiveEnded,
    /// Backend disposed, teardown complete
    Disposed,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was valid and state changed
    Success(PumpState),
    /// Event is a no-op in the current state (repeated close, late events)
    Ignored(PumpState),
    /// Transition was invalid from current state
    Invalid { from: PumpState, event: PumpEvent },
}

/// The lifecycle state machine of one pump
#[derive(Debug)]
pub struct PumpStateMachine {
    current_state: PumpState,
}

impl Default for PumpStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PumpStateMachine {
    /// Create a new state machine in Created state
    pub fn new() -> Self {
        Self {
            current_state: PumpState::Created,
        }
    }

    /// Get current state
    pub fn state(&self) -> PumpState {
        self.current_state
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: PumpEvent) -> TransitionResult {
        // Closed absorbs everything
        if self.current_state.is_terminal() {
            return TransitionResult::Ignored(self.current_state);
        }

        match self.get_next_state(event) {
            Some(state) if state == self.current_state => TransitionResult::Ignored(state),
            Some(state) => {
                self.current_state = state;
                TransitionResult::Success(state)
            }
            None => TransitionResult::Invalid {
                from: self.current_state,
                event,
            },
        }
    }

    /// Get the next state for a given event, or None if invalid
    fn get_next_state(&self, event: PumpEvent) -> Option<PumpState> {
        use PumpEvent::*;
        use PumpState::*;

        match (self.current_state, event) {
            (Created, OpenStarted) => Some(Opening),

            (Opening, Opened) => Some(Active),
            // Failure while opening skips Closing entirely
            (Opening, OpenFailed) => Some(Closed),
            (Opening, CloseRequested) => Some(Closing),

            (Active, CloseRequested) => Some(Closing),
            (Active, ReceiveEnded) => Some(Closing),

            (Closing, CloseRequested) => Some(Closing),
            (Closing, ReceiveEnded) => Some(Closing),
            (Closing, OpenFailed) => Some(Closed),

            // Teardown may complete from any live state
            (_, Disposed) => Some(Closed),

            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let fsm = PumpStateMachine::new();
        assert_eq!(fsm.state(), PumpState::Created);
    }

    #[test]
    fn test_normal_lifecycle() {
        let mut fsm = PumpStateMachine::new();

        let result = fsm.process_event(PumpEvent::OpenStarted);
        assert_eq!(result, TransitionResult::Success(PumpState::Opening));

        let result = fsm.process_event(PumpEvent::Opened);
        assert_eq!(result, TransitionResult::Success(PumpState::Active));

        let result = fsm.process_event(PumpEvent::CloseRequested);
        assert_eq!(result, TransitionResult::Success(PumpState::Closing));

        let result = fsm.process_event(PumpEvent::Disposed);
        assert_eq!(result, TransitionResult::Success(PumpState::Closed));
    }

    #[test]
    fn test_open_failure_goes_straight_to_closed() {
        let mut fsm = PumpStateMachine::new();
        fsm.process_event(PumpEvent::OpenStarted);

        let result = fsm.process_event(PumpEvent::OpenFailed);
        assert_eq!(result, TransitionResult::Success(PumpState::Closed));
    }

    #[test]
    fn test_repeated_close_is_ignored() {
        let mut fsm = PumpStateMachine::new();
        fsm.process_event(PumpEvent::OpenStarted);
        fsm.process_event(PumpEvent::Opened);
        fsm.process_event(PumpEvent::CloseRequested);

        let result = fsm.process_event(PumpEvent::CloseRequested);
        assert_eq!(result, TransitionResult::Ignored(PumpState::Closing));
        assert_eq!(fsm.state(), PumpState::Closing);
    }

    #[test]
    fn test_closed_absorbs_events() {
        let mut fsm = PumpStateMachine::new();
        fsm.process_event(PumpEvent::Disposed);
        assert_eq!(fsm.state(), PumpState::Closed);

        for event in [PumpEvent::OpenStarted, PumpEvent::CloseRequested, PumpEvent::Disposed] {
            let result = fsm.process_event(event);
            assert_eq!(result, TransitionResult::Ignored(PumpState::Closed));
        }
    }

    #[test]
    fn test_invalid_transition() {
        let mut fsm = PumpStateMachine::new();

        // Can't become active without opening first
        let result = fsm.process_event(PumpEvent::Opened);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(fsm.state(), PumpState::Created);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(PumpState::Active.to_string(), "active");
        assert_eq!(PumpState::Closed.to_string(), "closed");
    }
}
