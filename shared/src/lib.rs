//! Duplex Shared Wire Types
//!
//! This crate provides the frame codecs and the pump lifecycle state machine
//! used by every channel backend of the duplex transport.

pub mod codec;
pub mod state_machine;

pub use codec::{CodecError, LineFrameCodec, MessageAssembler};
pub use state_machine::{PumpEvent, PumpState, PumpStateMachine, TransitionResult};

/// One complete unit of the higher-level protocol exchanged in one direction
pub type Frame = String;

/// Limits and timing defaults for the transport
pub mod limits {
    /// Largest frame accepted from or written to the wire (16 MiB)
    pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

    /// Default time allowed for `open` (dial + handshake) in milliseconds
    pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

    /// Default time the receive loop is given to drain after a close request
    pub const CLOSE_GRACE_MS: u64 = 2_000;

    /// Default capacity of the inbound event queue
    pub const EVENT_QUEUE_CAPACITY: usize = 64;
}

/// Returns true if the frame can be written to a line-oriented channel
/// unchanged: no '\n' to split it and no '\r' for the reader to strip.
pub fn is_line_safe(frame: &str) -> bool {
    !frame.contains(['\r', '\n'])
}
