//! In-memory backend for exercising the pump without I/O

use crate::error::{PumpError, Result};
use crate::transport::ChannelBackend;
use async_trait::async_trait;
use duplex_shared::Frame;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Feeds inbound results to a [`ScriptedBackend`]; dropping it ends the
/// stream gracefully
pub type Script = mpsc::UnboundedSender<Result<Frame>>;

pub struct ScriptedBackend {
    inbound: Mutex<mpsc::UnboundedReceiver<Result<Frame>>>,
    open_error: Option<PumpError>,
    hanging_open: bool,
    send_delay: Duration,
    send_error: Option<PumpError>,
    sending: AtomicBool,
    sent: std::sync::Mutex<Vec<String>>,
    /// Set if a send started while another was still running
    pub overlapped: AtomicBool,
    pub closes: AtomicUsize,
    pub disposals: AtomicUsize,
    released: CancellationToken,
}

impl ScriptedBackend {
    pub fn new() -> (Self, Script) {
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = Self {
            inbound: Mutex::new(rx),
            open_error: None,
            hanging_open: false,
            send_delay: Duration::ZERO,
            send_error: None,
            sending: AtomicBool::new(false),
            sent: std::sync::Mutex::new(Vec::new()),
            overlapped: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
            disposals: AtomicUsize::new(0),
            released: CancellationToken::new(),
        };
        (backend, tx)
    }

    pub fn with_open_error(mut self, error: PumpError) -> Self {
        self.open_error = Some(error);
        self
    }

    /// `open` only returns once cancelled
    pub fn with_hanging_open(mut self) -> Self {
        self.hanging_open = true;
        self
    }

    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    /// Every send fails with `error`
    pub fn with_send_error(mut self, error: PumpError) -> Self {
        self.send_error = Some(error);
        self
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelBackend for ScriptedBackend {
    async fn open(&self, cancel: &CancellationToken) -> Result<()> {
        if self.hanging_open {
            cancel.cancelled().await;
            return Err(PumpError::Cancelled);
        }
        match &self.open_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn send_frame(&self, frame: &str, cancel: &CancellationToken) -> Result<()> {
        if self.sending.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PumpError::Cancelled),
            _ = tokio::time::sleep(self.send_delay) => match &self.send_error {
                Some(error) => Err(error.clone()),
                None => {
                    self.sent.lock().unwrap().push(frame.to_string());
                    Ok(())
                }
            },
        };

        self.sending.store(false, Ordering::SeqCst);
        result
    }

    async fn receive_frame(&self, cancel: &CancellationToken) -> Result<Frame> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PumpError::Cancelled),
            _ = self.released.cancelled() => Err(PumpError::Cancelled),
            next = inbound.recv() => next.unwrap_or(Err(PumpError::Cancelled)),
        }
    }

    async fn close(&self, _cancel: &CancellationToken) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        // The scripted peer acknowledges at once
        self.released.cancel();
        Ok(())
    }

    async fn dispose(&self) {
        self.disposals.fetch_add(1, Ordering::SeqCst);
        self.released.cancel();
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
