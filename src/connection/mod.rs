//! Connection setup and the duplex message pump
//!
//! A [`ConnectionDescriptor`] names the target and owns the cancellation
//! scope. `connect` builds the matching backend, starts a pump on it and hands
//! back a [`DuplexChannel`] once the pump is active.

mod descriptor;
mod pump;
#[cfg(test)]
pub(crate) mod testing;

pub use descriptor::{ConnectionDescriptor, TransportKind};
pub use pump::{ChannelEvent, DuplexChannel, FrameHandler, PumpConfig};
