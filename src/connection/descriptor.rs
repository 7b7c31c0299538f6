//! Connection descriptor: target parameters plus cancellation scope

use crate::connection::pump::{DuplexChannel, FrameHandler, PumpConfig};
use crate::error::{PumpError, Result};
use crate::transport::{ChannelBackend, SocketBackend, WebSocketBackend};
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Which backend a descriptor builds
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Newline-delimited frames over TCP (or TLS)
    #[default]
    Socket,
    /// One frame per WebSocket message, at `path` on the target
    WebSocket { path: String },
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Socket => write!(f, "socket"),
            TransportKind::WebSocket { .. } => write!(f, "websocket"),
        }
    }
}

/// Everything needed to stand up one pump instance.
///
/// Validated on construction, before any I/O. Builders consume the descriptor,
/// so a connected descriptor can be reused to connect again with identical
/// parameters.
#[derive(Debug, Clone)]
pub struct ConnectionDescriptor {
    host: String,
    port: u16,
    secure: bool,
    name: Option<String>,
    kind: TransportKind,
    config: PumpConfig,
    cancel: CancellationToken,
}

impl ConnectionDescriptor {
    pub fn new(host: impl Into<String>, port: u16, secure: bool) -> Result<Self> {
        let host = host.into();
        if host.is_empty() {
            return Err(PumpError::validation("host must not be empty"));
        }
        if host.chars().any(char::is_whitespace) {
            return Err(PumpError::validation(format!("host {host:?} contains whitespace")));
        }
        if port == 0 {
            return Err(PumpError::validation("port must be positive"));
        }

        Ok(Self {
            host,
            port,
            secure,
            name: None,
            kind: TransportKind::Socket,
            config: PumpConfig::default(),
            cancel: CancellationToken::new(),
        })
    }

    /// Session name used in logs; defaults to the address
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Tie every pump started from this descriptor to `cancel`
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_config(mut self, config: PumpConfig) -> Self {
        self.config = config;
        self
    }

    /// Use the WebSocket backend at `path` instead of a line-framed socket
    pub fn over_websocket(mut self, path: impl Into<String>) -> Self {
        self.kind = TransportKind::WebSocket { path: path.into() };
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn kind(&self) -> &TransportKind {
        &self.kind
    }

    pub fn config(&self) -> &PumpConfig {
        &self.config
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// `host:port`, with IPv6 literals bracketed
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.address())
    }

    /// Build the backend this descriptor describes, without opening it
    pub fn build_backend(&self) -> Box<dyn ChannelBackend> {
        let max_frame_len = self.config.max_frame_len;
        match &self.kind {
            TransportKind::Socket => Box::new(
                SocketBackend::tcp(self.host.clone(), self.port, self.secure)
                    .with_max_frame_len(max_frame_len),
            ),
            TransportKind::WebSocket { path } => Box::new(
                WebSocketBackend::new(&self.host, self.port, self.secure, path)
                    .with_max_frame_len(max_frame_len),
            ),
        }
    }

    /// Build the backend, start a pump on it and wait until it is `Active`.
    ///
    /// Rejects with the open failure if the pump closes first, and with
    /// `PumpError::Cancelled` as soon as the descriptor's scope is cancelled.
    pub async fn connect<H: FrameHandler>(&self, handler: H) -> Result<DuplexChannel> {
        self.connect_backend(self.build_backend(), handler).await
    }

    /// Same as [`connect`](Self::connect) for a backend built by the caller
    pub async fn connect_backend<B, H>(&self, backend: B, handler: H) -> Result<DuplexChannel>
    where
        B: ChannelBackend,
        H: FrameHandler,
    {
        if self.cancel.is_cancelled() {
            return Err(PumpError::Cancelled);
        }

        let name = self.name();
        let backend_name = backend.name();
        let (channel, ready) = DuplexChannel::start(
            name.clone(),
            backend,
            handler,
            self.config.clone(),
            self.cancel.child_token(),
        );

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PumpError::Cancelled),
            // A dropped sender means the pump went away without settling
            ready = ready => ready.unwrap_or(Err(PumpError::Cancelled)),
        };

        match outcome {
            Ok(()) => {
                info!(name = %name, address = %self.address(), backend = backend_name, "connected");
                Ok(channel)
            }
            Err(e) => {
                warn!(name = %name, address = %self.address(), error = %e, "connect failed");
                Err(e)
            }
        }
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match (&self.kind, self.secure) {
            (TransportKind::Socket, false) => "tcp",
            (TransportKind::Socket, true) => "tls",
            (TransportKind::WebSocket { .. }, false) => "ws",
            (TransportKind::WebSocket { .. }, true) => "wss",
        };
        write!(f, "{} ({}://{})", self.name(), scheme, self.address())
    }
}
