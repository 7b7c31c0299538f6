//! Error taxonomy for the transport
//!
//! Every failure that crosses the pump is one of four classes. The class, not
//! the message, decides what the pump does with it.

use duplex_shared::CodecError;
use thiserror::Error;

/// How the pump reacts to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad connection parameters, rejected before any I/O
    Validation,
    /// Channel-level fault: reported to the engine, pump closes
    Transport,
    /// Normal end of session: ends the receive loop silently
    Graceful,
    /// Unrecognised failure: reported, never retried, pump torn down
    Fatal,
}

/// Errors surfaced by backends, the pump and the connection descriptor
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PumpError {
    #[error("Invalid connection parameters: {0}")]
    Validation(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Channel closed")]
    Cancelled,

    #[error("Fatal transport failure: {0}")]
    Fatal(String),
}

impl PumpError {
    pub fn validation(reason: impl Into<String>) -> Self {
        PumpError::Validation(reason.into())
    }

    pub fn transport(reason: impl std::fmt::Display) -> Self {
        PumpError::Transport(reason.to_string())
    }

    pub fn fatal(reason: impl std::fmt::Display) -> Self {
        PumpError::Fatal(reason.to_string())
    }

    /// The "channel is not writable" fault
    pub fn not_open() -> Self {
        PumpError::Transport("channel is not open".into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            PumpError::Validation(_) => ErrorClass::Validation,
            PumpError::Transport(_) => ErrorClass::Transport,
            PumpError::Cancelled => ErrorClass::Graceful,
            PumpError::Fatal(_) => ErrorClass::Fatal,
        }
    }

    /// True for graceful closure and cancellation
    pub fn is_graceful(&self) -> bool {
        self.class() == ErrorClass::Graceful
    }
}

impl From<std::io::Error> for PumpError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            // Local programming errors rather than channel faults
            ErrorKind::InvalidInput | ErrorKind::Unsupported | ErrorKind::OutOfMemory => {
                PumpError::Fatal(err.to_string())
            }
            _ => PumpError::Transport(err.to_string()),
        }
    }
}

impl From<CodecError> for PumpError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(io) => io.into(),
            // The caller handed us a frame the channel cannot carry
            CodecError::EmbeddedNewline | CodecError::OutboundTooLong { .. } => {
                PumpError::Validation(err.to_string())
            }
            // Malformed or oversized inbound frames
            other => PumpError::Transport(other.to_string()),
        }
    }
}

pub type Result<T, E = PumpError> = std::result::Result<T, E>;
