//! Duplex transport adapter
//!
//! Turns a socket, a WebSocket or any byte stream into a bidirectional,
//! cancellable message channel: frames in, frames out, one send at a time,
//! failures reported once.
//!
//! ```no_run
//! use duplex_transport::{ChannelEvent, ConnectionDescriptor};
//! use tokio::sync::mpsc;
//!
//! # async fn demo() -> duplex_transport::Result<()> {
//! let (events_tx, mut events) = mpsc::channel::<ChannelEvent>(64);
//! let channel = ConnectionDescriptor::new("127.0.0.1", 5985, false)?
//!     .connect(events_tx)
//!     .await?;
//!
//! channel.send("HELLO").await?;
//! while let Some(event) = events.recv().await {
//!     match event {
//!         ChannelEvent::Frame(frame) => println!("{frame}"),
//!         ChannelEvent::Fault(e) => eprintln!("{e}"),
//!         ChannelEvent::Closed => break,
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod error;
pub mod transport;

pub use connection::{
    ChannelEvent, ConnectionDescriptor, DuplexChannel, FrameHandler, PumpConfig, TransportKind,
};
pub use duplex_shared::{Frame, PumpState};
pub use error::{ErrorClass, PumpError, Result};
