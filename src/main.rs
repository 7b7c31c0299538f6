//! dxpipe: pipe stdin lines through a duplex channel and print what comes back

use anyhow::{Context, Result};
use clap::Parser;
use duplex_transport::{ChannelEvent, ConnectionDescriptor, PumpConfig};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "dxpipe", version, about = "Exchange line frames with a remote endpoint")]
struct Cli {
    /// Remote host name or address
    host: String,

    /// Remote port
    port: u16,

    /// Wrap the connection in TLS
    #[arg(long)]
    tls: bool,

    /// Speak WebSocket instead of newline-delimited TCP
    #[arg(long)]
    websocket: bool,

    /// WebSocket request path
    #[arg(long, default_value = "/", requires = "websocket")]
    path: String,

    /// Session name shown in logs
    #[arg(long)]
    name: Option<String>,

    /// Give up connecting after this many seconds
    #[arg(long, value_name = "SECS")]
    connect_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries frames
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    let mut config = PumpConfig::default();
    if let Some(secs) = cli.connect_timeout {
        config.connect_timeout = Duration::from_secs(secs);
    }

    let shutdown = CancellationToken::new();
    let mut descriptor = ConnectionDescriptor::new(cli.host, cli.port, cli.tls)?
        .with_config(config.clone())
        .with_cancellation(shutdown.clone());
    if cli.websocket {
        descriptor = descriptor.over_websocket(cli.path);
    }
    if let Some(name) = cli.name {
        descriptor = descriptor.with_name(name);
    }

    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, closing channel");
            interrupt.cancel();
        }
    });

    let (events_tx, mut events) = mpsc::channel::<ChannelEvent>(config.event_queue_capacity);
    let channel = descriptor
        .connect(events_tx)
        .await
        .with_context(|| format!("failed to connect to {descriptor}"))?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut stdin_open = true;
    let mut fault = None;

    loop {
        tokio::select! {
            line = stdin.next_line(), if stdin_open => match line.context("failed to read stdin")? {
                Some(line) => {
                    if let Err(e) = channel.send(&line).await {
                        warn!(error = %e, "send failed");
                    }
                }
                None => {
                    debug!("stdin closed");
                    stdin_open = false;
                    let closing = channel.clone();
                    tokio::spawn(async move { closing.close().await });
                }
            },
            event = events.recv() => match event {
                Some(ChannelEvent::Frame(frame)) => {
                    stdout.write_all(frame.as_bytes()).await?;
                    stdout.write_all(b"\n").await?;
                    stdout.flush().await?;
                }
                Some(ChannelEvent::Fault(e)) => fault = Some(e),
                Some(ChannelEvent::Closed) | None => break,
            },
        }
    }

    match fault {
        Some(e) => Err(e).context("channel failed"),
        None => Ok(()),
    }
}
