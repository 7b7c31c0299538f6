//! Duplex message pump
//!
//! Bridges one [`ChannelBackend`] to the engine. A driver task opens the
//! backend, runs exactly one receive loop that hands frames to the engine's
//! [`FrameHandler`], and tears everything down once. Outbound frames go
//! straight to the backend from the caller's task, one at a time.

use crate::error::{PumpError, Result};
use crate::transport::ChannelBackend;
use async_trait::async_trait;
use duplex_shared::{limits, Frame, PumpEvent, PumpState, PumpStateMachine, TransitionResult};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, trace, warn};

/// Tuning for one pump instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpConfig {
    /// Upper bound on `open` (dial plus handshake)
    pub connect_timeout: Duration,
    /// How long `close` waits for the receive loop before cancelling it
    pub close_grace: Duration,
    /// Largest frame accepted in either direction
    pub max_frame_len: usize,
    /// Suggested capacity for a [`ChannelEvent`] queue
    pub event_queue_capacity: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(limits::CONNECT_TIMEOUT_MS),
            close_grace: Duration::from_millis(limits::CLOSE_GRACE_MS),
            max_frame_len: limits::MAX_FRAME_LEN,
            event_queue_capacity: limits::EVENT_QUEUE_CAPACITY,
        }
    }
}

/// Events delivered to an engine that consumes the channel as a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// One inbound frame, in wire order
    Frame(Frame),
    /// The channel faulted; it is closing
    Fault(PumpError),
    /// The channel reached `Closed`; nothing follows
    Closed,
}

/// The engine's side of the channel.
///
/// Calls come from the pump's own tasks, never concurrently with each other:
/// every `on_frame` in wire order, then at most one `on_fault`, then exactly
/// one `on_closed`.
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    /// Returning `Break` means nobody is consuming frames any more; the pump
    /// then closes the channel gracefully.
    async fn on_frame(&self, frame: Frame) -> ControlFlow<()>;

    async fn on_fault(&self, _error: PumpError) {}

    async fn on_closed(&self) {}
}

/// Forwards everything into the queue, waiting for room when it is full
#[async_trait]
impl FrameHandler for mpsc::Sender<ChannelEvent> {
    async fn on_frame(&self, frame: Frame) -> ControlFlow<()> {
        match self.send(ChannelEvent::Frame(frame)).await {
            Ok(()) => ControlFlow::Continue(()),
            // The receiver was dropped
            Err(_) => ControlFlow::Break(()),
        }
    }

    async fn on_fault(&self, error: PumpError) {
        let _ = self.send(ChannelEvent::Fault(error)).await;
    }

    async fn on_closed(&self) {
        let _ = self.send(ChannelEvent::Closed).await;
    }
}

/// State shared by the driver task, the receive loop and every handle
struct DuplexPump {
    name: String,
    backend: Box<dyn ChannelBackend>,
    handler: Box<dyn FrameHandler>,
    config: PumpConfig,
    /// The pump's cancellation scope, a child of the descriptor's
    cancel: CancellationToken,
    state: RwLock<PumpStateMachine>,
    /// Single-flight guard for the send path
    send_lock: Mutex<()>,
    /// First fault wins; later ones are only logged
    fault: OnceLock<PumpError>,
    close_requested: AtomicBool,
    finalized: AtomicBool,
    /// Cancelled once the pump is `Closed`
    finished: CancellationToken,
    ready: Mutex<Option<oneshot::Sender<Result<()>>>>,
}

impl DuplexPump {
    async fn state(&self) -> PumpState {
        self.state.read().await.state()
    }

    async fn transition(&self, event: PumpEvent) -> TransitionResult {
        let result = self.state.write().await.process_event(event);
        match &result {
            TransitionResult::Success(state) => {
                debug!(name = %self.name, state = %state, ?event, "pump state changed");
            }
            TransitionResult::Invalid { from, event } => {
                debug!(name = %self.name, state = %from, ?event, "transition not allowed");
            }
            TransitionResult::Ignored(_) => {}
        }
        result
    }

    async fn settle_ready(&self, outcome: Result<()>) {
        if let Some(tx) = self.ready.lock().await.take() {
            // The connect waiter may have given up already
            let _ = tx.send(outcome);
        }
    }

    /// Record a fault and cancel the pump. Only the first fault is kept.
    fn record_fault(&self, error: PumpError) {
        if self.finalized.load(Ordering::SeqCst) {
            debug!(name = %self.name, %error, "fault after teardown ignored");
            return;
        }
        if self.fault.set(error.clone()).is_ok() {
            warn!(name = %self.name, %error, "channel faulted");
        } else {
            debug!(name = %self.name, %error, "additional fault ignored");
        }
        self.cancel.cancel();
    }

    /// The error a caller sees once the channel is no longer writable
    fn terminal_error(&self) -> PumpError {
        self.fault.get().cloned().unwrap_or_else(PumpError::not_open)
    }

    async fn check_writable(&self) -> Result<()> {
        if let Some(fault) = self.fault.get() {
            return Err(fault.clone());
        }
        match self.state().await {
            PumpState::Active => Ok(()),
            _ => Err(PumpError::not_open()),
        }
    }

    async fn drive(self: Arc<Self>) {
        self.transition(PumpEvent::OpenStarted).await;
        debug!(name = %self.name, backend = self.backend.name(), "opening channel");

        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PumpError::Cancelled),
            result = timeout(self.config.connect_timeout, self.backend.open(&self.cancel)) => {
                result.unwrap_or_else(|_| {
                    Err(PumpError::transport(format!(
                        "connect timed out after {:?}",
                        self.config.connect_timeout
                    )))
                })
            }
        };

        let mut was_active = false;
        match opened {
            Ok(()) => match self.transition(PumpEvent::Opened).await {
                TransitionResult::Success(_) => {
                    was_active = true;
                    info!(name = %self.name, backend = self.backend.name(), "channel active");
                    self.settle_ready(Ok(())).await;
                    self.run_receive_loop().await;
                }
                // Close was requested while the open was completing
                _ => self.settle_ready(Err(PumpError::Cancelled)).await,
            },
            Err(e) => {
                if !e.is_graceful() {
                    self.record_fault(e.clone());
                }
                self.transition(PumpEvent::OpenFailed).await;
                self.settle_ready(Err(e)).await;
            }
        }

        self.finalize(was_active).await;
    }

    async fn run_receive_loop(self: &Arc<Self>) {
        // The loop runs in its own task so a panic is contained at the join
        let receiver = tokio::spawn(receive_loop(Arc::clone(self)));
        if let Err(e) = receiver.await {
            let error = if e.is_panic() {
                PumpError::fatal("receive loop panicked")
            } else {
                PumpError::fatal(e)
            };
            self.record_fault(error);
        }
    }

    async fn request_close(&self) {
        if self.close_requested.swap(true, Ordering::SeqCst) {
            return;
        }

        let previous = {
            let mut machine = self.state.write().await;
            let previous = machine.state();
            machine.process_event(PumpEvent::CloseRequested);
            previous
        };

        match previous {
            PumpState::Active => {
                debug!(name = %self.name, "closing channel");
                match timeout(self.config.close_grace, self.backend.close(&self.cancel)).await {
                    Ok(Ok(())) | Ok(Err(PumpError::Cancelled)) => {}
                    Ok(Err(e)) => debug!(name = %self.name, error = %e, "backend close failed"),
                    Err(_) => debug!(name = %self.name, "backend close timed out"),
                }
            }
            PumpState::Created | PumpState::Opening => self.cancel.cancel(),
            PumpState::Closing | PumpState::Closed => {}
        }
    }

    /// Cleanup: runs once, after the receive loop or a failed open
    async fn finalize(&self, was_active: bool) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        self.transition(PumpEvent::ReceiveEnded).await;

        // Remote end, fault or cancellation: the backend has not been asked yet
        if was_active && !self.close_requested.swap(true, Ordering::SeqCst) {
            let closing = CancellationToken::new();
            match timeout(self.config.close_grace, self.backend.close(&closing)).await {
                Ok(Ok(())) | Ok(Err(PumpError::Cancelled)) => {}
                Ok(Err(e)) => debug!(name = %self.name, error = %e, "backend close failed"),
                Err(_) => {
                    closing.cancel();
                    debug!(name = %self.name, "backend close timed out");
                }
            }
        }

        self.cancel.cancel();
        self.backend.dispose().await;
        self.transition(PumpEvent::Disposed).await;
        self.settle_ready(Err(self.fault.get().cloned().unwrap_or(PumpError::Cancelled)))
            .await;
        self.finished.cancel();
        info!(name = %self.name, faulted = self.fault.get().is_some(), "channel closed");

        if let Some(error) = self.fault.get() {
            self.handler.on_fault(error.clone()).await;
        }
        self.handler.on_closed().await;
    }
}

async fn receive_loop(pump: Arc<DuplexPump>) {
    loop {
        let frame = match pump.backend.receive_frame(&pump.cancel).await {
            Ok(frame) => frame,
            Err(e) if e.is_graceful() => {
                debug!(name = %pump.name, "receive loop finished");
                return;
            }
            Err(e) => {
                pump.record_fault(e);
                return;
            }
        };
        trace!(name = %pump.name, len = frame.len(), "frame received");

        let flow = tokio::select! {
            biased;
            _ = pump.cancel.cancelled() => return,
            flow = pump.handler.on_frame(frame) => flow,
        };
        if flow.is_break() {
            debug!(name = %pump.name, "frame consumer gone, closing channel");
            return;
        }
    }
}

/// The engine's handle on a live channel.
///
/// Clones share the same pump. Dropping the last clone cancels the pump,
/// which then cleans up in the background.
#[derive(Clone)]
pub struct DuplexChannel {
    pump: Arc<DuplexPump>,
    _guard: Arc<DropGuard>,
}

impl DuplexChannel {
    /// Spawn the pump's driver task. The receiver settles once the pump is
    /// `Active` or has failed on the way there.
    pub(crate) fn start<B, H>(
        name: String,
        backend: B,
        handler: H,
        config: PumpConfig,
        cancel: CancellationToken,
    ) -> (Self, oneshot::Receiver<Result<()>>)
    where
        B: ChannelBackend,
        H: FrameHandler,
    {
        let (ready_tx, ready_rx) = oneshot::channel();
        let guard = Arc::new(cancel.clone().drop_guard());
        let pump = Arc::new(DuplexPump {
            name,
            backend: Box::new(backend),
            handler: Box::new(handler),
            config,
            cancel,
            state: RwLock::new(PumpStateMachine::new()),
            send_lock: Mutex::new(()),
            fault: OnceLock::new(),
            close_requested: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            finished: CancellationToken::new(),
            ready: Mutex::new(Some(ready_tx)),
        });

        tokio::spawn(Arc::clone(&pump).drive());
        (Self { pump, _guard: guard }, ready_rx)
    }

    /// Send one frame. Concurrent callers queue behind each other; each
    /// frame is on the wire before the next one starts.
    ///
    /// Fails fast with the recorded fault once the channel is broken. A
    /// failure here other than a rejected frame breaks the channel.
    pub async fn send(&self, frame: impl AsRef<str>) -> Result<()> {
        let pump = &self.pump;
        let frame = frame.as_ref();
        pump.check_writable().await?;

        let _permit = tokio::select! {
            biased;
            _ = pump.cancel.cancelled() => return Err(pump.terminal_error()),
            permit = pump.send_lock.lock() => permit,
        };
        pump.check_writable().await?;

        match pump.backend.send_frame(frame, &pump.cancel).await {
            Ok(()) => {
                trace!(name = %pump.name, len = frame.len(), "frame sent");
                Ok(())
            }
            Err(PumpError::Cancelled) => Err(pump.terminal_error()),
            Err(e @ PumpError::Validation(_)) => Err(e),
            Err(e) => {
                pump.record_fault(e.clone());
                Err(e)
            }
        }
    }

    /// Close the channel and wait until it is `Closed`. Idempotent.
    pub async fn close(&self) {
        let pump = &self.pump;
        pump.request_close().await;

        if timeout(pump.config.close_grace, pump.finished.cancelled()).await.is_err() {
            debug!(name = %pump.name, "close grace elapsed, cancelling receive loop");
            pump.cancel.cancel();
            pump.finished.cancelled().await;
        }
    }

    /// Wait until the channel is `Closed`, however that happens
    pub async fn closed(&self) {
        self.pump.finished.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.pump.finished.is_cancelled()
    }

    pub async fn state(&self) -> PumpState {
        self.pump.state().await
    }

    /// True once a transport or fatal fault was recorded
    pub fn is_broken(&self) -> bool {
        self.pump.fault.get().is_some()
    }

    pub fn fault(&self) -> Option<PumpError> {
        self.pump.fault.get().cloned()
    }

    pub fn name(&self) -> &str {
        &self.pump.name
    }

    pub fn backend_name(&self) -> &'static str {
        self.pump.backend.name()
    }
}

impl std::fmt::Debug for DuplexChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexChannel")
            .field("name", &self.pump.name)
            .field("backend", &self.pump.backend.name())
            .field("broken", &self.is_broken())
            .field("closed", &self.is_closed())
            .finish()
    }
}
