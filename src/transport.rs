//! Message transport used by an attach session, and its WebSocket
//! implementation.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::listeners::{Listeners, Subscription};
use crate::protocol::WireMessage;

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("transport is closed")]
    Closed,
}

/// Connection readiness, mirroring the WebSocket `readyState` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Connecting),
            1 => Some(Self::Open),
            2 => Some(Self::Closing),
            3 => Some(Self::Closed),
            _ => None,
        }
    }
}

pub type MessageListener = dyn Fn(&WireMessage) + Send + Sync;
pub type CloseListener = dyn Fn() + Send + Sync;
pub type ErrorListener = dyn Fn(&TransportError) + Send + Sync;

/// An ordered, message-oriented duplex connection.
///
/// Implementations must not hold internal locks while invoking listeners: a
/// listener may unsubscribe itself (or every other listener) while running.
pub trait Transport: Send + Sync {
    fn ready_state(&self) -> ReadyState;

    fn send(&self, message: WireMessage) -> Result<(), TransportError>;

    fn on_message(&self, listener: Arc<MessageListener>) -> Subscription;

    fn on_close(&self, listener: Arc<CloseListener>) -> Subscription;

    fn on_error(&self, listener: Arc<ErrorListener>) -> Subscription;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Outbound {
    Message(Message),
    Close,
}

/// Client side WebSocket transport.
///
/// Sending is synchronous: messages are queued to a writer task. Inbound
/// messages are only read once [`WsTransport::start`] is called, so a session
/// can finish registering its listeners first.
pub struct WsTransport {
    state: AtomicU8,
    outbound: mpsc::UnboundedSender<Outbound>,
    reader: Mutex<Option<SplitStream<WsStream>>>,
    message_listeners: Arc<Listeners<MessageListener>>,
    close_listeners: Arc<Listeners<CloseListener>>,
    error_listeners: Arc<Listeners<ErrorListener>>,
}

impl WsTransport {
    /// Open a connection to `url` and wait for the handshake to finish.
    pub async fn connect(url: &str) -> Result<Arc<Self>, TransportError> {
        tracing::debug!(%url, "connecting");
        let (stream, _response) = connect_async(url).await.map_err(|e| TransportError::Connect {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let (sink, reader) = stream.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let transport = Arc::new(Self {
            state: AtomicU8::new(ReadyState::Open as u8),
            outbound: outbound_tx,
            reader: Mutex::new(Some(reader)),
            message_listeners: Listeners::new(),
            close_listeners: Listeners::new(),
            error_listeners: Listeners::new(),
        });

        let weak = Arc::downgrade(&transport);
        tokio::spawn(async move {
            if let Err(e) = write_loop(sink, outbound_rx).await {
                tracing::debug!(error = %e, "websocket writer stopped");
                if let Some(transport) = weak.upgrade() {
                    transport.fail(e);
                }
            }
        });

        tracing::info!(%url, "connected");
        Ok(transport)
    }

    /// Spawn the reader task that dispatches inbound messages to listeners.
    ///
    /// Returns `None` if the reader was already started.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let reader = self.reader.lock().take()?;
        let transport = self.clone();
        Some(tokio::spawn(async move { transport.read_loop(reader).await }))
    }

    /// Begin the closing handshake.
    pub fn close(&self) {
        if self.transition(ReadyState::Open, ReadyState::Closing) {
            let _ = self.outbound.send(Outbound::Close);
        }
    }

    async fn read_loop(&self, mut reader: SplitStream<WsStream>) {
        while let Some(result) = reader.next().await {
            match result {
                Ok(Message::Text(text)) => self.emit_message(WireMessage::Text(text.as_str().to_string())),
                Ok(Message::Binary(data)) => self.emit_message(WireMessage::Binary(data)),
                Ok(Message::Close(frame)) => {
                    tracing::debug!(?frame, "websocket close received");
                    self.transition(ReadyState::Open, ReadyState::Closing);
                }
                Ok(_) => continue, // ping/pong handled by tungstenite
                Err(e) => {
                    self.fail(TransportError::WebSocket(e.to_string()));
                    return;
                }
            }
        }
        self.finish();
    }

    fn emit_message(&self, message: WireMessage) {
        for listener in self.message_listeners.snapshot() {
            listener(&message);
        }
    }

    fn fail(&self, error: TransportError) {
        if self.state() == ReadyState::Closed {
            return;
        }
        tracing::warn!(%error, "websocket transport failed");
        for listener in self.error_listeners.snapshot() {
            listener(&error);
        }
        self.finish();
    }

    fn finish(&self) {
        let previous = self.state.swap(ReadyState::Closed as u8, Ordering::AcqRel);
        if previous == ReadyState::Closed as u8 {
            return;
        }
        let _ = self.outbound.send(Outbound::Close);
        for listener in self.close_listeners.snapshot() {
            listener();
        }
    }

    fn state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(ReadyState::Closed)
    }

    fn transition(&self, from: ReadyState, to: ReadyState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Transport for WsTransport {
    fn ready_state(&self) -> ReadyState {
        self.state()
    }

    fn send(&self, message: WireMessage) -> Result<(), TransportError> {
        let message = match message {
            WireMessage::Text(text) => Message::Text(text.into()),
            WireMessage::Binary(data) => Message::Binary(data),
        };
        self.outbound
            .send(Outbound::Message(message))
            .map_err(|_| TransportError::Closed)
    }

    fn on_message(&self, listener: Arc<MessageListener>) -> Subscription {
        self.message_listeners.subscribe(listener)
    }

    fn on_close(&self, listener: Arc<CloseListener>) -> Subscription {
        self.close_listeners.subscribe(listener)
    }

    fn on_error(&self, listener: Arc<ErrorListener>) -> Subscription {
        self.error_listeners.subscribe(listener)
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) -> Result<(), TransportError> {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Message(message) => sink
                .send(message)
                .await
                .map_err(|e| TransportError::WebSocket(e.to_string()))?,
            Outbound::Close => {
                let _ = sink.close().await;
                return Ok(());
            }
        }
    }
    Ok(())
}
