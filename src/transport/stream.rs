//! Line-framed backend over any byte stream
//!
//! Used directly when the caller hands in an already-open stream, and by the
//! socket backend once it has dialed.

use crate::error::{PumpError, Result};
use crate::transport::traits::{ChannelBackend, TransportStream};
use async_trait::async_trait;
use duplex_shared::{Frame, LineFrameCodec};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

/// Receives a borrowed stream back once the backend is disposed
pub type StreamReturn<S> = oneshot::Receiver<S>;

/// Channel backend framing one frame per line over a byte stream
pub struct StreamBackend<S: TransportStream> {
    reader: Mutex<Option<FramedRead<ReadHalf<S>, LineFrameCodec>>>,
    writer: Mutex<Option<FramedWrite<WriteHalf<S>, LineFrameCodec>>>,
    /// Set for borrowed streams: dispose hands the stream back instead of dropping it
    return_tx: Mutex<Option<oneshot::Sender<S>>>,
    borrowed: bool,
    /// Cancelled by dispose so in-flight calls release their locks
    released: CancellationToken,
    write_closed: AtomicBool,
    disposed: AtomicBool,
}

impl<S: TransportStream> StreamBackend<S> {
    /// Wrap a stream the backend owns; dispose drops (closes) it
    pub fn owned(stream: S) -> Self {
        Self::new(stream, None)
    }

    /// Wrap a stream the caller keeps; dispose hands it back through the
    /// returned receiver. Bytes already buffered by the decoder are discarded.
    pub fn borrowed(stream: S) -> (Self, StreamReturn<S>) {
        let (tx, rx) = oneshot::channel();
        (Self::new(stream, Some(tx)), rx)
    }

    fn new(stream: S, return_tx: Option<oneshot::Sender<S>>) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let borrowed = return_tx.is_some();
        Self {
            reader: Mutex::new(Some(FramedRead::new(read_half, LineFrameCodec::new()))),
            writer: Mutex::new(Some(FramedWrite::new(write_half, LineFrameCodec::new()))),
            return_tx: Mutex::new(return_tx),
            borrowed,
            released: CancellationToken::new(),
            write_closed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    /// Limit the size of frames in both directions
    pub fn with_max_frame_len(mut self, max_len: usize) -> Self {
        if let Some(reader) = self.reader.get_mut() {
            *reader.decoder_mut() = LineFrameCodec::with_max_len(max_len);
        }
        if let Some(writer) = self.writer.get_mut() {
            *writer.encoder_mut() = LineFrameCodec::with_max_len(max_len);
        }
        self
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<S: TransportStream> ChannelBackend for StreamBackend<S> {
    async fn open(&self, _cancel: &CancellationToken) -> Result<()> {
        if self.is_disposed() {
            return Err(PumpError::not_open());
        }
        Ok(())
    }

    async fn send_frame(&self, frame: &str, cancel: &CancellationToken) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(PumpError::not_open)?;
        if self.write_closed.load(Ordering::SeqCst) {
            return Err(PumpError::not_open());
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PumpError::Cancelled),
            _ = self.released.cancelled() => Err(PumpError::not_open()),
            result = writer.send(frame) => result.map_err(PumpError::from),
        }
    }

    async fn receive_frame(&self, cancel: &CancellationToken) -> Result<Frame> {
        let mut guard = self.reader.lock().await;
        let Some(reader) = guard.as_mut() else {
            return Err(PumpError::Cancelled);
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PumpError::Cancelled),
            _ = self.released.cancelled() => Err(PumpError::Cancelled),
            next = reader.next() => match next {
                Some(Ok(frame)) => Ok(frame),
                Some(Err(e)) => Err(e.into()),
                // End of stream is the peer's graceful close
                None => Err(PumpError::Cancelled),
            },
        }
    }

    async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Ok(());
        };
        if self.write_closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Flush pending frames. An owned stream is also half-closed so the peer
        // sees end-of-stream; a borrowed one stays writable for its owner.
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PumpError::Cancelled),
            _ = self.released.cancelled() => return Ok(()),
            result = async {
                if self.borrowed {
                    SinkExt::<&str>::flush(writer).await
                } else {
                    SinkExt::<&str>::close(writer).await
                }
            } => result,
        };
        match result {
            Ok(()) => Ok(()),
            Err(duplex_shared::CodecError::Io(e)) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.released.cancel();

        let reader = self.reader.lock().await.take();
        let writer = self.writer.lock().await.take();
        let Some(return_tx) = self.return_tx.lock().await.take() else {
            return;
        };

        match (reader, writer) {
            (Some(reader), Some(writer)) => {
                let read_half = reader.into_inner();
                let write_half = writer.into_inner();
                if read_half.is_pair_of(&write_half) {
                    // Receiver may be gone; then the stream is simply dropped
                    let _ = return_tx.send(read_half.unsplit(write_half));
                }
            }
            _ => tracing::warn!("stream halves missing at dispose, borrowed stream dropped"),
        }
    }

    fn name(&self) -> &'static str {
        "stream"
    }
}
