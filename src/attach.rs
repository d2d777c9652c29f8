//! Attach session: binds one transport to one terminal widget.
//!
//! Inbound transport messages are decoded and applied to the terminal; local
//! terminal events (when bidirectional) are encoded and sent over the
//! transport. The session owns every listener subscription it registers and
//! tears all of them down exactly once on [`AttachSession::dispose`], which
//! also runs when the transport closes or errors, or when the handle is
//! dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::listeners::Subscription;
use crate::protocol::{self, Frame, WireMessage};
use crate::terminal::{TerminalSize, TerminalWidget};
use crate::transport::{ReadyState, Transport, TransportError};

/// Errors surfaced to whoever drives the outbound path.
///
/// `NotYetOpen` and `TransportClosed` mean the owner sequenced the session
/// incorrectly; they are returned rather than swallowed so the local input is
/// not silently lost.
#[derive(Error, Debug)]
pub enum AttachError {
    #[error("attach session used before the transport was open")]
    NotYetOpen,

    #[error("attach session transport is closed")]
    TransportClosed,

    #[error("attach session is already activated")]
    AlreadyActivated,

    #[error("attach session is disposed")]
    Disposed,

    #[error("transport send failed: {0}")]
    Transport(#[from] TransportError),
}

/// Construction options.
#[derive(Debug, Clone, Copy)]
pub struct AttachOptions {
    /// Forward local terminal input and resizes to the transport. When false
    /// the session only renders what the remote end sends.
    pub bidirectional: bool,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self { bidirectional: true }
    }
}

/// Lifecycle of an [`AttachSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Activating,
    Active,
    Disposed,
}

/// Per-session frame counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub invalid_frames: u64,
    pub dropped_sends: u64,
}

#[derive(Default)]
struct Counters {
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    invalid_frames: AtomicU64,
    dropped_sends: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SessionStats {
        SessionStats {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            invalid_frames: self.invalid_frames.load(Ordering::Relaxed),
            dropped_sends: self.dropped_sends.load(Ordering::Relaxed),
        }
    }
}

struct Shared {
    transport: Arc<dyn Transport>,
    bidirectional: bool,
    state: Mutex<SessionState>,
    subscriptions: Mutex<Vec<Subscription>>,
    counters: Counters,
    /// Cancelled on disposal. Doubles as the disposed flag checked by every
    /// handler body.
    disposed: CancellationToken,
}

/// One transport bound to one terminal widget.
pub struct AttachSession {
    shared: Arc<Shared>,
}

impl AttachSession {
    pub fn new(transport: Arc<dyn Transport>, options: AttachOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                bidirectional: options.bidirectional,
                state: Mutex::new(SessionState::Created),
                subscriptions: Mutex::new(Vec::new()),
                counters: Counters::default(),
                disposed: CancellationToken::new(),
            }),
        }
    }

    /// Register every listener and enter [`SessionState::Active`].
    ///
    /// Transport message/close/error listeners are always registered; the
    /// terminal data/binary/resize listeners only when bidirectional. If the
    /// transport closes while registration is in progress, the listeners
    /// collected so far are torn down and the session stays disposed.
    pub fn activate(&self, terminal: Arc<dyn TerminalWidget>) -> Result<(), AttachError> {
        {
            let mut state = self.shared.state.lock();
            match *state {
                SessionState::Created => *state = SessionState::Activating,
                SessionState::Disposed => return Err(AttachError::Disposed),
                SessionState::Activating | SessionState::Active => {
                    return Err(AttachError::AlreadyActivated)
                }
            }
        }

        if self.shared.transport.ready_state() == ReadyState::Connecting {
            tracing::warn!("attach session activated while the transport is still connecting");
        }

        let subscriptions = self.register(terminal);
        let registered = subscriptions.len();

        let mut state = self.shared.state.lock();
        if *state == SessionState::Disposed {
            drop(state);
            for mut subscription in subscriptions {
                subscription.unsubscribe();
            }
            tracing::debug!("attach session disposed during activation");
            return Ok(());
        }
        self.shared.subscriptions.lock().extend(subscriptions);
        *state = SessionState::Active;
        drop(state);

        tracing::debug!(
            subscriptions = registered,
            bidirectional = self.shared.bidirectional,
            "attach session active"
        );
        Ok(())
    }

    fn register(&self, terminal: Arc<dyn TerminalWidget>) -> Vec<Subscription> {
        let transport = &self.shared.transport;
        let mut subscriptions = Vec::with_capacity(6);

        let weak = Arc::downgrade(&self.shared);
        let target = terminal.clone();
        subscriptions.push(transport.on_message(Arc::new(move |message: &WireMessage| {
            if let Some(shared) = weak.upgrade() {
                shared.dispatch(message, target.as_ref());
            }
        })));

        let weak = Arc::downgrade(&self.shared);
        subscriptions.push(transport.on_close(Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                tracing::debug!("transport closed");
                shared.dispose();
            }
        })));

        let weak = Arc::downgrade(&self.shared);
        subscriptions.push(transport.on_error(Arc::new(move |error: &TransportError| {
            if let Some(shared) = weak.upgrade() {
                tracing::debug!(%error, "transport error");
                shared.dispose();
            }
        })));

        if self.shared.bidirectional {
            let weak = Arc::downgrade(&self.shared);
            subscriptions.push(terminal.on_data(Arc::new(move |text: &str| {
                with_shared(&weak, |shared| shared.send_data(text.as_bytes()))
            })));

            let weak = Arc::downgrade(&self.shared);
            subscriptions.push(terminal.on_binary(Arc::new(move |data: &str| {
                with_shared(&weak, |shared| shared.send_binary(data))
            })));

            let weak = Arc::downgrade(&self.shared);
            subscriptions.push(terminal.on_resize(Arc::new(move |size: TerminalSize| {
                with_shared(&weak, |shared| shared.send_resize(size.cols, size.rows))
            })));
        }

        subscriptions
    }

    /// Tear down every subscription. Safe to call any number of times.
    pub fn dispose(&self) {
        self.shared.dispose();
    }

    /// Send terminal bytes as a data frame. Fails with
    /// [`AttachError::Disposed`] once the session is torn down.
    pub fn send_data(&self, payload: &[u8]) -> Result<(), AttachError> {
        self.shared.send_data(payload)
    }

    /// Send widget binary data, where each char carries one byte.
    pub fn send_binary(&self, data: &str) -> Result<(), AttachError> {
        self.shared.send_binary(data)
    }

    pub fn send_resize(&self, cols: u16, rows: u16) -> Result<(), AttachError> {
        self.shared.send_resize(cols, rows)
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    pub fn is_bidirectional(&self) -> bool {
        self.shared.bidirectional
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.counters.snapshot()
    }

    /// Resolves once the session has been disposed.
    pub async fn closed(&self) {
        self.shared.disposed.cancelled().await;
    }
}

impl Drop for AttachSession {
    fn drop(&mut self) {
        self.shared.dispose();
    }
}

impl std::fmt::Debug for AttachSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachSession")
            .field("state", &self.state())
            .field("bidirectional", &self.shared.bidirectional)
            .finish_non_exhaustive()
    }
}

/// Widget binary data carries one byte per char; keep the low 8 bits.
fn binary_to_bytes(data: &str) -> Vec<u8> {
    data.chars().map(|c| (u32::from(c) & 0xFF) as u8).collect()
}

fn with_shared(
    weak: &Weak<Shared>,
    f: impl FnOnce(&Shared) -> Result<(), AttachError>,
) -> Result<(), AttachError> {
    match weak.upgrade() {
        // Local events already in flight when the session is disposed are
        // discarded rather than reported back to the widget.
        Some(shared) if !shared.is_disposed() => f(&shared),
        _ => Ok(()),
    }
}

impl Shared {
    fn is_disposed(&self) -> bool {
        self.disposed.is_cancelled()
    }

    fn dispose(&self) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Disposed {
                return;
            }
            *state = SessionState::Disposed;
            self.disposed.cancel();
        }

        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        let count = subscriptions.len();
        for mut subscription in subscriptions {
            subscription.unsubscribe();
        }
        tracing::debug!(subscriptions = count, "attach session disposed");
    }

    fn dispatch(&self, message: &WireMessage, terminal: &dyn TerminalWidget) {
        if self.is_disposed() {
            return;
        }
        match protocol::decode(message) {
            Ok(Frame::Data(payload)) => {
                self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
                terminal.write(&payload);
            }
            Ok(Frame::Resize { cols, rows }) => {
                self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(cols, rows, "remote resize");
                terminal.resize(cols, rows);
            }
            Err(error) => {
                self.counters.invalid_frames.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%error, len = message.len(), "dropping attach frame");
            }
        }
    }

    fn send_data(&self, payload: &[u8]) -> Result<(), AttachError> {
        self.guarded_send(|| protocol::encode_data(payload))
    }

    fn send_binary(&self, data: &str) -> Result<(), AttachError> {
        self.guarded_send(|| protocol::encode_data(&binary_to_bytes(data)))
    }

    fn send_resize(&self, cols: u16, rows: u16) -> Result<(), AttachError> {
        self.guarded_send(|| protocol::encode_resize(cols, rows))
    }

    fn guarded_send(&self, encode: impl FnOnce() -> WireMessage) -> Result<(), AttachError> {
        if self.is_disposed() {
            tracing::debug!("attach session is disposed, refusing send");
            return Err(AttachError::Disposed);
        }
        match self.transport.ready_state() {
            ReadyState::Open => {}
            ReadyState::Connecting => return Err(AttachError::NotYetOpen),
            ReadyState::Closing => {
                self.counters.dropped_sends.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("attach session transport is closing, dropping send");
                return Ok(());
            }
            ReadyState::Closed => return Err(AttachError::TransportClosed),
        }
        self.transport.send(encode())?;
        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
