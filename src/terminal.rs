use std::io::{Read, Write};
use std::sync::Arc;

use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size, SetSize};
use parking_lot::Mutex;
use thiserror::Error;

use crate::attach::AttachError;
use crate::listeners::{Listeners, Subscription};

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("failed to enable raw mode: {0}")]
    EnableRawMode(#[source] std::io::Error),

    #[error("failed to query terminal size: {0}")]
    Size(#[source] std::io::Error),

    #[error("stdin is not a terminal")]
    NotATerminal,

    #[error("failed to start stdin reader: {0}")]
    Stdin(#[source] std::io::Error),
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Local data listener. Errors go back to the widget that emitted the event.
pub type DataListener = dyn Fn(&str) -> Result<(), AttachError> + Send + Sync;
pub type ResizeListener = dyn Fn(TerminalSize) -> Result<(), AttachError> + Send + Sync;

/// A terminal that renders remote output and produces local input.
///
/// `on_binary` delivers data that is not valid text; each char carries one
/// byte in its low 8 bits.
pub trait TerminalWidget: Send + Sync {
    fn write(&self, data: &[u8]);

    fn resize(&self, cols: u16, rows: u16);

    fn on_data(&self, listener: Arc<DataListener>) -> Subscription;

    fn on_binary(&self, listener: Arc<DataListener>) -> Subscription;

    fn on_resize(&self, listener: Arc<ResizeListener>) -> Subscription;
}

/// RAII guard for terminal raw mode.
///
/// When created, enables raw mode on the terminal. When dropped (even on panic),
/// restores the terminal to its previous state.
///
/// Raw mode is needed to capture all keystrokes (including Ctrl+C, etc.) and
/// forward them to the remote shell instead of having the local terminal
/// handle them.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn new() -> Result<Self, TerminalError> {
        enable_raw_mode().map_err(TerminalError::EnableRawMode)?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Get the current size of the controlling terminal.
pub fn terminal_size() -> Result<TerminalSize, TerminalError> {
    let (cols, rows) = size().map_err(TerminalError::Size)?;
    Ok(TerminalSize { cols, rows })
}

/// Split raw stdin bytes into a text or binary event.
fn classify_input(bytes: &[u8]) -> LocalInput {
    match std::str::from_utf8(bytes) {
        Ok(text) => LocalInput::Data(text.to_string()),
        Err(_) => LocalInput::Binary(bytes.iter().map(|b| char::from(*b)).collect()),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LocalInput {
    Data(String),
    Binary(String),
}

/// The process's own terminal as a [`TerminalWidget`].
///
/// Remote output is written to stdout. Stdin is read on a blocking thread and
/// window changes are picked up from SIGWINCH once [`LocalTerminal::start`]
/// is called.
pub struct LocalTerminal {
    stdout: Mutex<std::io::Stdout>,
    data_listeners: Arc<Listeners<DataListener>>,
    binary_listeners: Arc<Listeners<DataListener>>,
    resize_listeners: Arc<Listeners<ResizeListener>>,
}

impl LocalTerminal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            stdout: Mutex::new(std::io::stdout()),
            data_listeners: Listeners::new(),
            binary_listeners: Listeners::new(),
            resize_listeners: Listeners::new(),
        })
    }

    /// Start pumping stdin and SIGWINCH into listener events.
    ///
    /// Stdin is read on a detached thread: a blocked read must not keep the
    /// runtime alive after the session ends.
    pub fn start(self: &Arc<Self>) -> Result<(), TerminalError> {
        let terminal = self.clone();
        std::thread::Builder::new()
            .name("wsterm-stdin".to_string())
            .spawn(move || terminal.pump_stdin())
            .map_err(TerminalError::Stdin)?;

        #[cfg(unix)]
        {
            let terminal = self.clone();
            tokio::spawn(async move { terminal.watch_resize().await });
        }
        Ok(())
    }

    fn pump_stdin(&self) {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => {
                    tracing::debug!("stdin closed");
                    break;
                }
                Ok(n) => {
                    if let Err(e) = self.emit_input(&buf[..n]) {
                        tracing::error!(error = %e, "failed to forward local input");
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "stdin read failed");
                    break;
                }
            }
        }
    }

    fn emit_input(&self, bytes: &[u8]) -> Result<(), AttachError> {
        let (listeners, payload) = match classify_input(bytes) {
            LocalInput::Data(text) => (&self.data_listeners, text),
            LocalInput::Binary(data) => (&self.binary_listeners, data),
        };
        for listener in listeners.snapshot() {
            listener(&payload)?;
        }
        Ok(())
    }

    #[cfg(unix)]
    async fn watch_resize(&self) {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigwinch = match signal(SignalKind::window_change()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "cannot watch window size changes");
                return;
            }
        };
        while sigwinch.recv().await.is_some() {
            let size = match terminal_size() {
                Ok(size) => size,
                Err(e) => {
                    tracing::warn!(error = %e, "terminal size unavailable");
                    continue;
                }
            };
            for listener in self.resize_listeners.snapshot() {
                if let Err(e) = listener(size) {
                    tracing::error!(error = %e, "failed to forward resize");
                    return;
                }
            }
        }
    }
}

impl TerminalWidget for LocalTerminal {
    fn write(&self, data: &[u8]) {
        let mut stdout = self.stdout.lock();
        if let Err(e) = stdout.write_all(data).and_then(|()| stdout.flush()) {
            tracing::error!(error = %e, "stdout write failed");
        }
    }

    fn resize(&self, cols: u16, rows: u16) {
        let mut stdout = self.stdout.lock();
        if let Err(e) = crossterm::execute!(stdout, SetSize(cols, rows)) {
            tracing::warn!(cols, rows, error = %e, "local terminal refused resize");
        }
    }

    fn on_data(&self, listener: Arc<DataListener>) -> Subscription {
        self.data_listeners.subscribe(listener)
    }

    fn on_binary(&self, listener: Arc<DataListener>) -> Subscription {
        self.binary_listeners.subscribe(listener)
    }

    fn on_resize(&self, listener: Arc<ResizeListener>) -> Subscription {
        self.resize_listeners.subscribe(listener)
    }
}
