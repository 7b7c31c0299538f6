//! TCP (optionally TLS) connector used by the socket-stream backend

use crate::error::{PumpError, Result};
use crate::transport::tls;
use crate::transport::traits::{BoxedStream, TransportConnector};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

/// TCP connector for connecting to a `host:port` address
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    secure: bool,
}

impl TcpConnector {
    /// Create a connector for a plain TCP stream
    pub fn plain(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            secure: false,
        }
    }

    /// Create a connector that wraps the TCP stream in TLS
    pub fn secure(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            secure: true,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn dial(&self) -> Result<TcpStream> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| PumpError::transport(format!("connect to {} failed: {}", self.address(), e)))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl TransportConnector for TcpConnector {
    async fn connect(&self) -> Result<BoxedStream> {
        let stream = self.dial().await?;
        if !self.secure {
            return Ok(Box::new(stream));
        }

        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| PumpError::validation(format!("invalid TLS server name {}: {}", self.host, e)))?;
        let tls_stream = TlsConnector::from(tls::client_config())
            .connect(server_name, stream)
            .await
            .map_err(|e| PumpError::transport(format!("TLS handshake with {} failed: {}", self.address(), e)))?;
        Ok(Box::new(tls_stream))
    }

    fn name(&self) -> &'static str {
        if self.secure {
            "TLS"
        } else {
            "TCP"
        }
    }
}
