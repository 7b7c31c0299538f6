//! Transport trait abstraction for pluggable channel backends

use crate::error::Result;
use async_trait::async_trait;
use duplex_shared::Frame;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// A byte stream a line-framed backend can run over
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> TransportStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Boxed stream produced by a [`TransportConnector`]
pub type BoxedStream = Box<dyn TransportStream>;

/// Factory for dialed byte streams
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Attempt to connect, returning a stream on success
    async fn connect(&self) -> Result<BoxedStream>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}

/// The capability set every channel backend exposes to the pump.
///
/// A backend owns exactly one I/O resource. The pump guarantees that
/// `send_frame` is never called while a previous call is still in flight and
/// that only one task ever calls `receive_frame`; the two may run
/// concurrently with each other.
#[async_trait]
pub trait ChannelBackend: Send + Sync + 'static {
    /// Establish the underlying resource (dial, handshake).
    ///
    /// Backends that are connected at construction time return `Ok(())`.
    async fn open(&self, cancel: &CancellationToken) -> Result<()>;

    /// Transmit one outbound frame.
    ///
    /// Fails with `PumpError::Transport` if the channel is not writable.
    async fn send_frame(&self, frame: &str, cancel: &CancellationToken) -> Result<()>;

    /// Wait for exactly one inbound frame.
    ///
    /// Graceful remote closure and cancellation yield `PumpError::Cancelled`;
    /// abrupt closure yields `PumpError::Transport` carrying the reason.
    async fn receive_frame(&self, cancel: &CancellationToken) -> Result<Frame>;

    /// Request a graceful shutdown. Tolerates being called while already
    /// closing or closed.
    async fn close(&self, cancel: &CancellationToken) -> Result<()>;

    /// Release the resource. Idempotent and infallible; safe to call from any
    /// task.
    async fn dispose(&self);

    /// Short backend name for logs
    fn name(&self) -> &'static str;
}

#[async_trait]
impl<B: ChannelBackend + ?Sized> ChannelBackend for Box<B> {
    async fn open(&self, cancel: &CancellationToken) -> Result<()> {
        (**self).open(cancel).await
    }

    async fn send_frame(&self, frame: &str, cancel: &CancellationToken) -> Result<()> {
        (**self).send_frame(frame, cancel).await
    }

    async fn receive_frame(&self, cancel: &CancellationToken) -> Result<Frame> {
        (**self).receive_frame(cancel).await
    }

    async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        (**self).close(cancel).await
    }

    async fn dispose(&self) {
        (**self).dispose().await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

#[async_trait]
impl<B: ChannelBackend + ?Sized> ChannelBackend for Arc<B> {
    async fn open(&self, cancel: &CancellationToken) -> Result<()> {
        (**self).open(cancel).await
    }

    async fn send_frame(&self, frame: &str, cancel: &CancellationToken) -> Result<()> {
        (**self).send_frame(frame, cancel).await
    }

    async fn receive_frame(&self, cancel: &CancellationToken) -> Result<Frame> {
        (**self).receive_frame(cancel).await
    }

    async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        (**self).close(cancel).await
    }

    async fn dispose(&self) {
        (**self).dispose().await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
