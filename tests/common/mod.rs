#![allow(dead_code)]

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use wsterm::attach::AttachError;
use wsterm::listeners::{Listeners, Subscription};
use wsterm::protocol::WireMessage;
use wsterm::pty::SpawnCommand;
use wsterm::server::{self, AppState};
use wsterm::terminal::{DataListener, ResizeListener, TerminalSize, TerminalWidget};
use wsterm::transport::{
    CloseListener, ErrorListener, MessageListener, ReadyState, Transport, TransportError,
};

/// In-memory transport that records sends and lets tests inject events.
pub struct FakeTransport {
    state: Mutex<ReadyState>,
    sent: Mutex<Vec<WireMessage>>,
    messages: Arc<Listeners<MessageListener>>,
    closes: Arc<Listeners<CloseListener>>,
    errors: Arc<Listeners<ErrorListener>>,
}

impl FakeTransport {
    pub fn new(state: ReadyState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            sent: Mutex::new(Vec::new()),
            messages: Listeners::new(),
            closes: Listeners::new(),
            errors: Listeners::new(),
        })
    }

    pub fn open() -> Arc<Self> {
        Self::new(ReadyState::Open)
    }

    pub fn set_state(&self, state: ReadyState) {
        *self.state.lock() = state;
    }

    pub fn sent(&self) -> Vec<WireMessage> {
        self.sent.lock().clone()
    }

    pub fn emit_message(&self, message: WireMessage) {
        for listener in self.messages.snapshot() {
            listener(&message);
        }
    }

    /// Mark closed and fire the close listeners, as a real socket would.
    pub fn emit_close(&self) {
        self.set_state(ReadyState::Closed);
        for listener in self.closes.snapshot() {
            listener();
        }
    }

    pub fn emit_error(&self, error: TransportError) {
        for listener in self.errors.snapshot() {
            listener(&error);
        }
    }

    /// Active (message, close, error) listener counts.
    pub fn listener_counts(&self) -> (usize, usize, usize) {
        (self.messages.len(), self.closes.len(), self.errors.len())
    }
}

impl Transport for FakeTransport {
    fn ready_state(&self) -> ReadyState {
        *self.state.lock()
    }

    fn send(&self, message: WireMessage) -> Result<(), TransportError> {
        self.sent.lock().push(message);
        Ok(())
    }

    fn on_message(&self, listener: Arc<MessageListener>) -> Subscription {
        self.messages.subscribe(listener)
    }

    fn on_close(&self, listener: Arc<CloseListener>) -> Subscription {
        self.closes.subscribe(listener)
    }

    fn on_error(&self, listener: Arc<ErrorListener>) -> Subscription {
        self.errors.subscribe(listener)
    }
}

/// Terminal widget spy: records writes and resizes, emits local events.
pub struct FakeTerminal {
    written: Mutex<Vec<u8>>,
    resizes: Mutex<Vec<(u16, u16)>>,
    data: Arc<Listeners<DataListener>>,
    binary: Arc<Listeners<DataListener>>,
    resize: Arc<Listeners<ResizeListener>>,
}

impl FakeTerminal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            written: Mutex::new(Vec::new()),
            resizes: Mutex::new(Vec::new()),
            data: Listeners::new(),
            binary: Listeners::new(),
            resize: Listeners::new(),
        })
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.resizes.lock().clone()
    }

    /// Simulate the user typing text.
    pub fn type_data(&self, text: &str) -> Result<(), AttachError> {
        for listener in self.data.snapshot() {
            listener(text)?;
        }
        Ok(())
    }

    /// Simulate binary input, one char per byte.
    pub fn type_binary(&self, data: &str) -> Result<(), AttachError> {
        for listener in self.binary.snapshot() {
            listener(data)?;
        }
        Ok(())
    }

    /// Simulate the local terminal being resized.
    pub fn resize_local(&self, cols: u16, rows: u16) -> Result<(), AttachError> {
        for listener in self.resize.snapshot() {
            listener(TerminalSize::new(cols, rows))?;
        }
        Ok(())
    }

    /// Active (data, binary, resize) listener counts.
    pub fn listener_counts(&self) -> (usize, usize, usize) {
        (self.data.len(), self.binary.len(), self.resize.len())
    }
}

impl TerminalWidget for FakeTerminal {
    fn write(&self, data: &[u8]) {
        self.written.lock().extend_from_slice(data);
    }

    fn resize(&self, cols: u16, rows: u16) {
        self.resizes.lock().push((cols, rows));
    }

    fn on_data(&self, listener: Arc<DataListener>) -> Subscription {
        self.data.subscribe(listener)
    }

    fn on_binary(&self, listener: Arc<DataListener>) -> Subscription {
        self.binary.subscribe(listener)
    }

    fn on_resize(&self, listener: Arc<ResizeListener>) -> Subscription {
        self.resize.subscribe(listener)
    }
}

/// State for a server spawning `/bin/sh` in the system temp directory.
pub fn sh_state() -> AppState {
    AppState::new(SpawnCommand {
        shell: Some("/bin/sh".to_string()),
        cwd: Some(std::env::temp_dir()),
    })
}

/// Serve `state` on an ephemeral local port.
pub async fn start_server(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = server::router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
