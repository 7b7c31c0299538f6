//! Message-socket backend over a WebSocket client connection
//!
//! One frame per message. Outbound frames go out as a single text message.
//! tungstenite reassembles continuation fragments before a message is
//! yielded, so every inbound message is already whole; the
//! [`MessageAssembler`] only enforces the frame limit and UTF-8 decoding.

use crate::error::{PumpError, Result};
use crate::transport::tls;
use crate::transport::traits::ChannelBackend;
use async_trait::async_trait;
use duplex_shared::{limits, Frame, MessageAssembler};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Inbound {
    stream: SplitStream<WsStream>,
    assembler: MessageAssembler,
}

/// Channel backend that owns a WebSocket client connection
pub struct WebSocketBackend {
    url: String,
    secure: bool,
    max_frame_len: usize,
    /// Held for the whole send+flush so outbound operations never overlap
    sink: Mutex<Option<SplitSink<WsStream, Message>>>,
    inbound: Mutex<Option<Inbound>>,
    /// Cancelled by dispose so in-flight calls release their locks
    released: CancellationToken,
    close_sent: AtomicBool,
    disposed: AtomicBool,
}

impl WebSocketBackend {
    /// Backend connecting to `ws[s]://host:port/path`
    pub fn new(host: &str, port: u16, secure: bool, path: &str) -> Self {
        let scheme = if secure { "wss" } else { "ws" };
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]")
        } else {
            host.to_string()
        };
        let path = path.trim_start_matches('/');

        Self {
            url: format!("{scheme}://{host}:{port}/{path}"),
            secure,
            max_frame_len: limits::MAX_FRAME_LEN,
            sink: Mutex::new(None),
            inbound: Mutex::new(None),
            released: CancellationToken::new(),
            close_sent: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn with_max_frame_len(mut self, max_len: usize) -> Self {
        self.max_frame_len = max_len;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Map a close notification to graceful closure or an abrupt-closure fault
fn close_outcome(frame: Option<CloseFrame<'_>>) -> PumpError {
    match frame {
        None => PumpError::Cancelled,
        Some(frame) if matches!(frame.code, CloseCode::Normal | CloseCode::Away) => PumpError::Cancelled,
        Some(frame) => PumpError::transport(format!(
            "closed by peer with code {}: {}",
            u16::from(frame.code),
            frame.reason
        )),
    }
}

fn classify(err: WsError) -> PumpError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => PumpError::Cancelled,
        WsError::Io(e) => e.into(),
        WsError::Http(response) => {
            PumpError::transport(format!("handshake rejected with HTTP {}", response.status()))
        }
        // Local misuse rather than anything the peer did
        e @ (WsError::Url(_) | WsError::HttpFormat(_) | WsError::WriteBufferFull(_)) => PumpError::fatal(e),
        e => PumpError::transport(e),
    }
}

#[async_trait]
impl ChannelBackend for WebSocketBackend {
    async fn open(&self, cancel: &CancellationToken) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(PumpError::not_open());
        }

        let connector = self.secure.then(|| Connector::Rustls(tls::client_config()));
        let connecting = connect_async_tls_with_config(self.url.as_str(), None, true, connector);
        let (ws, response) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PumpError::Cancelled),
            _ = self.released.cancelled() => return Err(PumpError::not_open()),
            result = connecting => result.map_err(|e| match classify(e) {
                // A refused or dropped handshake is a failed connect, not a graceful end
                PumpError::Cancelled => PumpError::transport("connection closed during handshake"),
                other => other,
            })?,
        };
        debug!(url = %self.url, status = %response.status(), "websocket connected");

        let (sink, stream) = ws.split();
        *self.sink.lock().await = Some(sink);
        *self.inbound.lock().await = Some(Inbound {
            stream,
            assembler: MessageAssembler::new(self.max_frame_len),
        });
        Ok(())
    }

    async fn send_frame(&self, frame: &str, cancel: &CancellationToken) -> Result<()> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or_else(PumpError::not_open)?;
        if self.close_sent.load(Ordering::SeqCst) {
            return Err(PumpError::not_open());
        }
        if frame.len() > self.max_frame_len {
            return Err(PumpError::validation(format!(
                "outbound frame too long: {} bytes (max: {})",
                frame.len(),
                self.max_frame_len
            )));
        }

        // `send` flushes, so the next frame only starts after this one is on the wire
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PumpError::Cancelled),
            _ = self.released.cancelled() => Err(PumpError::not_open()),
            result = sink.send(Message::Text(frame.to_owned())) => result.map_err(|e| match classify(e) {
                PumpError::Cancelled => PumpError::not_open(),
                other => other,
            }),
        }
    }

    async fn receive_frame(&self, cancel: &CancellationToken) -> Result<Frame> {
        let mut guard = self.inbound.lock().await;
        let Some(inbound) = guard.as_mut() else {
            return Err(PumpError::Cancelled);
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PumpError::Cancelled),
                _ = self.released.cancelled() => return Err(PumpError::Cancelled),
                next = inbound.stream.next() => next,
            };

            let assembled = match next {
                None => return Err(PumpError::transport("connection ended without a close handshake")),
                Some(Err(e)) => return Err(classify(e)),
                Some(Ok(Message::Text(text))) => inbound.assembler.push(text.as_bytes(), true)?,
                Some(Ok(Message::Binary(data))) => inbound.assembler.push(&data, true)?,
                // Raw frames are only ever produced for writing
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => None,
                Some(Ok(Message::Close(frame))) => return Err(close_outcome(frame)),
            };

            if let Some(frame) = assembled {
                return Ok(frame);
            }
        }
    }

    async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        if self.close_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Ok(());
        };
        let notification = Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        }));

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PumpError::Cancelled),
            _ = self.released.cancelled() => return Ok(()),
            result = sink.send(notification) => result,
        };
        match result {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.released.cancel();

        // Dropping both halves drops the socket
        let sink = self.sink.lock().await.take();
        let inbound = self.inbound.lock().await.take();
        drop((sink, inbound));
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use std::future::Future;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::{Data, OpCode};
    use tokio_tungstenite::tungstenite::protocol::frame::Frame as WireFrame;

    /// Accept one WebSocket client on a loopback port and run `peer` on it
    async fn spawn_peer<F, Fut>(peer: F) -> (u16, JoinHandle<()>)
    where
        F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            peer(ws).await;
        });
        (port, handle)
    }

    #[test]
    fn test_url_building() {
        assert_eq!(WebSocketBackend::new("example.com", 443, true, "/exec").url(), "wss://example.com:443/exec");
        assert_eq!(WebSocketBackend::new("127.0.0.1", 80, false, "").url(), "ws://127.0.0.1:80/");
        assert_eq!(WebSocketBackend::new("::1", 8080, false, "ws").url(), "ws://[::1]:8080/ws");
    }

    #[test]
    fn test_close_outcome() {
        assert_eq!(close_outcome(None), PumpError::Cancelled);

        let normal = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        assert_eq!(close_outcome(Some(normal)), PumpError::Cancelled);

        let abnormal = CloseFrame {
            code: CloseCode::Error,
            reason: "server fault".into(),
        };
        let err = close_outcome(Some(abnormal));
        assert_eq!(err.class(), ErrorClass::Transport);
        assert!(err.to_string().contains("1011"));
    }

    #[tokio::test]
    async fn test_exchanges_messages_with_peer() {
        let (port, peer) = spawn_peer(|mut ws| async move {
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_text() {
                    ws.send(msg).await.unwrap();
                }
            }
        })
        .await;

        let backend = WebSocketBackend::new("127.0.0.1", port, false, "/");
        let cancel = CancellationToken::new();
        backend.open(&cancel).await.unwrap();

        backend.send_frame("<frame 1/>", &cancel).await.unwrap();
        assert_eq!(backend.receive_frame(&cancel).await.unwrap(), "<frame 1/>");

        backend.close(&cancel).await.unwrap();
        // The peer answers our close: graceful
        assert_eq!(backend.receive_frame(&cancel).await, Err(PumpError::Cancelled));
        backend.dispose().await;
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_fragmented_message_is_one_frame() {
        let (port, _peer) = spawn_peer(|mut ws| async move {
            let first = WireFrame::message(b"hello ".to_vec(), OpCode::Data(Data::Text), false);
            let rest = WireFrame::message(b"world".to_vec(), OpCode::Data(Data::Continue), true);
            ws.send(Message::Frame(first)).await.unwrap();
            ws.send(Message::Frame(rest)).await.unwrap();
            let _ = ws.next().await;
        })
        .await;

        let backend = WebSocketBackend::new("127.0.0.1", port, false, "/");
        let cancel = CancellationToken::new();
        backend.open(&cancel).await.unwrap();

        // Continuations are joined by tungstenite before the message surfaces
        assert_eq!(backend.receive_frame(&cancel).await.unwrap(), "hello world");
        backend.dispose().await;
    }

    #[tokio::test]
    async fn test_oversized_send_is_validation_error() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let (port, _peer) = spawn_peer(|mut ws| async move {
            let first = loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => break Some(text),
                    Some(Ok(_)) => continue,
                    _ => break None,
                }
            };
            let _ = tx.send(first);
        })
        .await;

        let backend = WebSocketBackend::new("127.0.0.1", port, false, "/").with_max_frame_len(4);
        let cancel = CancellationToken::new();
        backend.open(&cancel).await.unwrap();

        let err = backend.send_frame("too long", &cancel).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Validation);

        // The connection is untouched and the next frame goes through
        backend.send_frame("ok", &cancel).await.unwrap();
        assert_eq!(rx.await.unwrap().as_deref(), Some("ok"));
        backend.dispose().await;
    }

    #[tokio::test]
    async fn test_abnormal_close_is_transport_error() {
        let (port, _peer) = spawn_peer(|mut ws| async move {
            let frame = CloseFrame {
                code: CloseCode::Library(4000),
                reason: "session evicted".into(),
            };
            ws.close(Some(frame)).await.unwrap();
            let _ = ws.next().await;
        })
        .await;

        let backend = WebSocketBackend::new("127.0.0.1", port, false, "/");
        let cancel = CancellationToken::new();
        backend.open(&cancel).await.unwrap();

        let err = backend.receive_frame(&cancel).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transport);
        assert!(err.to_string().contains("session evicted"));
    }

    #[tokio::test]
    async fn test_back_to_back_sends_arrive_in_order() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let (port, _peer) = spawn_peer(|mut ws| async move {
            let mut seen = Vec::new();
            while seen.len() < 2 {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => seen.push(text),
                    Some(Ok(_)) => continue,
                    _ => break,
                }
            }
            let _ = tx.send(seen);
        })
        .await;

        let backend = WebSocketBackend::new("127.0.0.1", port, false, "/");
        let cancel = CancellationToken::new();
        backend.open(&cancel).await.unwrap();

        let big = "x".repeat(256 * 1024);
        let (first, second) = tokio::join!(backend.send_frame(&big, &cancel), backend.send_frame("small", &cancel));
        first.unwrap();
        second.unwrap();

        let seen = rx.await.unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].len(), big.len());
        assert_eq!(seen[1], "small");
    }

    #[tokio::test]
    async fn test_refused_open_is_transport_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let backend = WebSocketBackend::new("127.0.0.1", port, false, "/");
        let err = backend.open(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transport);
    }

    #[tokio::test]
    async fn test_send_after_close_fails_fast() {
        let (port, _peer) = spawn_peer(|mut ws| async move {
            while ws.next().await.is_some() {}
        })
        .await;

        let backend = WebSocketBackend::new("127.0.0.1", port, false, "/");
        let cancel = CancellationToken::new();
        backend.open(&cancel).await.unwrap();
        backend.close(&cancel).await.unwrap();
        backend.close(&cancel).await.unwrap();

        assert_eq!(backend.send_frame("late", &cancel).await, Err(PumpError::not_open()));
        backend.dispose().await;
        backend.dispose().await;
    }
}
