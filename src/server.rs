//! HTTP/WebSocket server exposing a shell per connection.
//!
//! `GET /ws?w=<cols>&h=<rows>` upgrades to the attach frame protocol and
//! spawns the configured shell in a PTY of that size. Data frames go to the
//! PTY, resize frames resize it, and PTY output comes back as data frames.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::protocol::{self, Frame, WireMessage};
use crate::pty::{Pty, SpawnCommand};
use crate::terminal::TerminalSize;

/// Capacity of the PTY input/output channels, in chunks of up to 4 KiB.
const PTY_CHANNEL_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("server error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Clone)]
pub struct AppState {
    pub command: Arc<SpawnCommand>,
    /// Cancelled to close every open socket and stop the server.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(command: SpawnCommand) -> Self {
        Self {
            command: Arc::new(command),
            shutdown: CancellationToken::new(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_attach))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on `bind` until `state.shutdown` is cancelled.
pub async fn serve(bind: SocketAddr, state: AppState) -> Result<(), ServerError> {
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|source| ServerError::Bind { addr: bind, source })?;
    tracing::info!(addr = %listener.local_addr()?, "HTTP/WS server listening");

    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Initial PTY size from the `w`/`h` query parameters. Missing, zero or
/// unparsable values fall back to 80x24.
fn requested_size(params: &HashMap<String, String>) -> TerminalSize {
    let default = TerminalSize::default();
    let dimension = |key: &str, fallback: u16| {
        params
            .get(key)
            .and_then(|v| v.parse::<u16>().ok())
            .filter(|v| *v != 0)
            .unwrap_or(fallback)
    };
    TerminalSize::new(dimension("w", default.cols), dimension("h", default.rows))
}

async fn ws_attach(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let size = requested_size(&params);
    ws.on_upgrade(move |socket| handle_socket(socket, state, size))
}

fn to_ws(message: WireMessage) -> Message {
    match message {
        WireMessage::Text(text) => Message::Text(text.into()),
        WireMessage::Binary(data) => Message::Binary(data),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, size: TerminalSize) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut attached = match spawn_pty(&state.command, size) {
        Ok(attached) => attached,
        Err(e) => {
            tracing::error!(error = %e, "failed to start shell");
            let close_frame = CloseFrame {
                code: close_code::ERROR,
                reason: "internal error".into(),
            };
            let _ = ws_tx.send(Message::Close(Some(close_frame))).await;
            return;
        }
    };
    tracing::info!(pid = ?attached.pty.pid(), cols = size.cols, rows = size.rows, "shell attached");

    let close_frame = loop {
        tokio::select! {
            // PTY output -> WebSocket
            chunk = attached.output_rx.recv() => {
                match chunk {
                    Some(data) => {
                        if ws_tx.send(to_ws(protocol::encode_data(&data))).await.is_err() {
                            break None;
                        }
                    }
                    None => {
                        tracing::debug!("shell exited");
                        break Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: "".into(),
                        });
                    }
                }
            }

            // WebSocket frames -> PTY
            msg = ws_rx.next() => {
                let message = match msg {
                    Some(Ok(Message::Binary(data))) => WireMessage::Binary(data),
                    Some(Ok(Message::Text(text))) => WireMessage::Text(text.as_str().to_string()),
                    Some(Ok(Message::Close(_))) | None => break None,
                    Some(Ok(_)) => continue, // Ping/Pong handled automatically
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "websocket read failed");
                        break None;
                    }
                };
                if !attached.apply(&message).await {
                    break None;
                }
            }

            _ = state.shutdown.cancelled() => {
                tracing::debug!("WebSocket received shutdown signal, closing");
                break Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: "server shutting down".into(),
                });
            }
        }
    };

    if let Some(close_frame) = close_frame {
        let _ = ws_tx.send(Message::Close(Some(close_frame))).await;
        let _ = ws_tx.flush().await;
    }

    if let Err(e) = attached.pty.kill() {
        tracing::warn!(error = %e, "failed to kill shell");
    }
    tracing::info!("shell detached");
}

/// A spawned PTY plus the channels feeding its blocking I/O threads.
struct AttachedPty {
    pty: Pty,
    input_tx: mpsc::Sender<Bytes>,
    output_rx: mpsc::Receiver<Bytes>,
}

impl AttachedPty {
    /// Apply one inbound message. Returns false once the PTY can no longer
    /// accept input.
    async fn apply(&mut self, message: &WireMessage) -> bool {
        match protocol::decode(message) {
            Ok(Frame::Data(data)) => self.input_tx.send(data).await.is_ok(),
            Ok(Frame::Resize { cols, rows }) => {
                tracing::debug!(cols, rows, "resize");
                if let Err(e) = self.pty.resize(rows, cols) {
                    tracing::warn!(error = %e, "pty resize failed");
                }
                true
            }
            Err(error) => {
                tracing::warn!(%error, "dropping attach frame");
                true
            }
        }
    }
}

fn spawn_pty(command: &SpawnCommand, size: TerminalSize) -> Result<AttachedPty, crate::pty::PtyError> {
    let pty = Pty::spawn(size.rows, size.cols, command)?;
    let reader = pty.take_reader()?;
    let writer = pty.take_writer()?;

    let (output_tx, output_rx) = mpsc::channel(PTY_CHANNEL_CAPACITY);
    tokio::task::spawn_blocking(move || pump_output(reader, output_tx));

    let (input_tx, input_rx) = mpsc::channel(PTY_CHANNEL_CAPACITY);
    tokio::task::spawn_blocking(move || pump_input(writer, input_rx));

    Ok(AttachedPty {
        pty,
        input_tx,
        output_rx,
    })
}

fn pump_output(mut reader: Box<dyn Read + Send>, output_tx: mpsc::Sender<Bytes>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if output_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    break;
                }
            }
            Err(e) => {
                // EIO is how Linux reports that the child side went away.
                if e.raw_os_error() != Some(5) {
                    tracing::debug!(error = %e, "pty read failed");
                }
                break;
            }
        }
    }
}

fn pump_input(mut writer: Box<dyn Write + Send>, mut input_rx: mpsc::Receiver<Bytes>) {
    while let Some(data) = input_rx.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
            tracing::debug!(error = %e, "pty write failed");
            break;
        }
    }
}
