//! TCP socket server.
//!
//! Clients send one JSON object per line, `{"command": "...", "parameters":
//! {...}}`; replies go back as one JSON object per line terminated by
//! `\r\n`. One client is served at a time.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ControllerError, Result};
use crate::handler::{CommandHandler, VALID_SIMULATION_MODES};
use crate::protocol::{key, Command};
use crate::response::{Reply, ResponseCode};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5000;

/// Replies buffered for a slow client before read loops wait.
const REPLY_QUEUE: usize = 256;

/// Time a shutting-down connection gets to flush its last replies.
const SHUTDOWN_FLUSH: Duration = Duration::from_secs(1);

/// Line terminator of outgoing messages.
const TERMINATOR: &[u8] = b"\r\n";

pub struct SocketServer {
    host: String,
    port: u16,
    simulation_mode: i64,
    disconnected_channel: Option<usize>,
    mock_interval: Option<Duration>,
    listener: Option<TcpListener>,
    shutdown: CancellationToken,
}

impl SocketServer {
    pub fn new(host: impl Into<String>, port: u16, simulation_mode: i64) -> Result<Self> {
        if !VALID_SIMULATION_MODES.contains(&simulation_mode) {
            return Err(ControllerError::InvalidSimulationMode(simulation_mode));
        }
        Ok(Self {
            host: host.into(),
            port,
            simulation_mode,
            disconnected_channel: None,
            mock_interval: None,
            listener: None,
            shutdown: CancellationToken::new(),
        })
    }

    /// Mock channel reporting the disconnected value (simulation mode only).
    pub fn with_disconnected_channel(mut self, channel: Option<usize>) -> Self {
        self.disconnected_channel = channel;
        self
    }

    pub fn with_mock_interval(mut self, interval: Duration) -> Self {
        self.mock_interval = Some(interval);
        self
    }

    /// Token that stops [`serve`](Self::serve) when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the listening socket; port 0 picks a free port.
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let listener = TcpListener::bind((self.host.as_str(), self.port)).await?;
        let addr = listener.local_addr()?;
        info!(%addr, simulation_mode = self.simulation_mode, "server listening");
        self.listener = Some(listener);
        Ok(addr)
    }

    /// Accept clients until `exit` is received or the shutdown token is
    /// cancelled.
    pub async fn serve(&mut self) -> Result<()> {
        let listener = self.listener.take().ok_or(ControllerError::NotBound)?;

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };

            info!(%peer, "client connected");
            if let Err(e) = self.serve_client(stream).await {
                error!(%peer, error = %e, "connection failed");
            }
            info!(%peer, "client disconnected");
        }

        info!("server stopped");
        Ok(())
    }

    async fn serve_client(&self, stream: TcpStream) -> Result<()> {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(REPLY_QUEUE);
        let mut writer = tokio::spawn(write_replies(write_half, rx));

        let mut handler = CommandHandler::new(tx, self.simulation_mode)?
            .with_disconnected_channel(self.disconnected_channel);
        if let Some(interval) = self.mock_interval {
            handler = handler.with_mock_interval(interval);
        }

        let mut lines = BufReader::new(read_half).lines();
        loop {
            let line = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "read from client failed");
                    break;
                }
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (command, parameters) = match parse_request(line) {
                Ok(request) => request,
                Err(reason) => {
                    warn!(request = %line, "{reason}");
                    handler
                        .reply(Reply::Response(ResponseCode::UnknownCommand))
                        .await;
                    continue;
                }
            };

            let handled = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => false,
                _ = handler.handle_command(command, &parameters) => true,
            };
            if !handled {
                break;
            }
            match command {
                Command::Disconnect => break,
                Command::Exit => {
                    self.shutdown.cancel();
                    break;
                }
                _ => {}
            }
        }

        handler.shutdown().await;
        drop(handler);

        // A client that stopped reading keeps the writer blocked on the
        // socket. On shutdown it gets a moment to flush, then pending
        // replies are dropped.
        let joined = tokio::select! {
            biased;
            joined = &mut writer => Some(joined),
            _ = self.shutdown.cancelled() => {
                tokio::time::timeout(SHUTDOWN_FLUSH, &mut writer).await.ok()
            }
        };
        match joined {
            Some(Ok(())) => {}
            Some(Err(e)) => warn!(error = %e, "writer task ended abnormally"),
            None => {
                debug!("client not reading, dropping pending replies");
                writer.abort();
            }
        }
        Ok(())
    }
}

/// Split a request line into its command and parameters.
pub fn parse_request(line: &str) -> std::result::Result<(Command, Value), String> {
    let request: Value =
        serde_json::from_str(line).map_err(|e| format!("invalid JSON request: {e}"))?;
    let command = request
        .get(key::COMMAND)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing key {}", key::COMMAND))?;
    let command = Command::from_str(command)?;
    let parameters = request
        .get(key::PARAMETERS)
        .cloned()
        .unwrap_or_else(|| Value::Object(Map::new()));
    Ok((command, parameters))
}

async fn write_replies(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Reply>) {
    while let Some(reply) = rx.recv().await {
        let mut message = match serde_json::to_vec(&reply) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "cannot encode reply");
                continue;
            }
        };
        message.extend_from_slice(TERMINATOR);
        if let Err(e) = writer.write_all(&message).await {
            debug!(error = %e, "client gone, dropping replies");
            break;
        }
    }
    writer.shutdown().await.ok();
}
