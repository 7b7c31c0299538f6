//! Socket-stream backend: dials an address, then frames one frame per line

use crate::error::{PumpError, Result};
use crate::transport::stream::StreamBackend;
use crate::transport::tcp::TcpConnector;
use crate::transport::traits::{BoxedStream, ChannelBackend, TransportConnector};
use async_trait::async_trait;
use duplex_shared::{limits, Frame};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Channel backend that owns a dialed socket
pub struct SocketBackend<C: TransportConnector = TcpConnector> {
    connector: C,
    max_frame_len: usize,
    /// Line-framed stream, present once `open` succeeded
    inner: OnceCell<StreamBackend<BoxedStream>>,
    disposed: AtomicBool,
}

impl SocketBackend<TcpConnector> {
    /// Backend dialing `host:port`, wrapped in TLS when `secure` is set
    pub fn tcp(host: impl Into<String>, port: u16, secure: bool) -> Self {
        let connector = if secure {
            TcpConnector::secure(host, port)
        } else {
            TcpConnector::plain(host, port)
        };
        Self::new(connector)
    }
}

impl<C: TransportConnector> SocketBackend<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            max_frame_len: limits::MAX_FRAME_LEN,
            inner: OnceCell::new(),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn with_max_frame_len(mut self, max_len: usize) -> Self {
        self.max_frame_len = max_len;
        self
    }

    pub fn is_open(&self) -> bool {
        self.inner.initialized() && !self.disposed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<C: TransportConnector + 'static> ChannelBackend for SocketBackend<C> {
    async fn open(&self, cancel: &CancellationToken) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(PumpError::not_open());
        }
        if self.inner.initialized() {
            return Ok(());
        }

        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PumpError::Cancelled),
            stream = self.connector.connect() => stream?,
        };
        debug!(transport = self.connector.name(), "socket connected");

        let framed = StreamBackend::owned(stream).with_max_frame_len(self.max_frame_len);
        if self.inner.set(framed).is_err() {
            return Err(PumpError::fatal("socket backend opened twice"));
        }

        // Dispose raced with the dial: release what we just built
        if self.disposed.load(Ordering::SeqCst) {
            if let Some(inner) = self.inner.get() {
                inner.dispose().await;
            }
            return Err(PumpError::not_open());
        }
        Ok(())
    }

    async fn send_frame(&self, frame: &str, cancel: &CancellationToken) -> Result<()> {
        match self.inner.get() {
            Some(inner) => inner.send_frame(frame, cancel).await,
            None => Err(PumpError::not_open()),
        }
    }

    async fn receive_frame(&self, cancel: &CancellationToken) -> Result<Frame> {
        match self.inner.get() {
            Some(inner) => inner.receive_frame(cancel).await,
            None => Err(PumpError::not_open()),
        }
    }

    async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        match self.inner.get() {
            Some(inner) => inner.close(cancel).await,
            None => Ok(()),
        }
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.inner.get() {
            inner.dispose().await;
        }
    }

    fn name(&self) -> &'static str {
        "socket"
    }
}
