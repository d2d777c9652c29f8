//! Terminal client: attaches the local terminal to a remote shell.
//!
//! Connects a [`WsTransport`] to the server's `/ws` endpoint, puts the local
//! terminal into raw mode and runs an [`AttachSession`] until the session is
//! disposed (remote close, transport error, or local input failing).

use std::io::IsTerminal;
use std::sync::Arc;

use thiserror::Error;

use crate::attach::{AttachError, AttachOptions, AttachSession};
use crate::terminal::{self, LocalTerminal, RawModeGuard, TerminalError, TerminalSize};
use crate::transport::{Transport, TransportError, WsTransport};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("terminal error: {0}")]
    Terminal(#[from] TerminalError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("attach error: {0}")]
    Attach(#[from] AttachError),
}

/// WebSocket URL of the attach endpoint for a terminal of `size`.
///
/// `address` is `host:port`; a `ws://` or `wss://` prefix is kept as given.
pub fn attach_url(address: &str, size: TerminalSize) -> String {
    let base = if address.starts_with("ws://") || address.starts_with("wss://") {
        address.trim_end_matches('/').to_string()
    } else {
        format!("ws://{}", address.trim_end_matches('/'))
    };
    format!("{}/ws?w={}&h={}", base, size.cols, size.rows)
}

/// Attach the controlling terminal to the server at `address`.
///
/// Returns once the remote side closes the connection.
pub async fn attach(address: &str, receive_only: bool) -> Result<(), ClientError> {
    if !std::io::stdin().is_terminal() {
        return Err(TerminalError::NotATerminal.into());
    }
    let size = terminal::terminal_size()?;
    let url = attach_url(address, size);

    let transport = WsTransport::connect(&url).await?;

    // Receive-only leaves the terminal cooked so Ctrl+C still ends the client.
    let _raw_guard = if receive_only {
        None
    } else {
        Some(RawModeGuard::new()?)
    };
    let local = LocalTerminal::new();

    let session = AttachSession::new(
        transport.clone() as Arc<dyn Transport>,
        AttachOptions {
            bidirectional: !receive_only,
        },
    );
    session.activate(local.clone())?;

    transport.start();
    if !receive_only {
        local.start()?;
    }

    session.closed().await;
    transport.close();

    let stats = session.stats();
    tracing::info!(
        frames_received = stats.frames_received,
        frames_sent = stats.frames_sent,
        invalid_frames = stats.invalid_frames,
        "detached"
    );
    Ok(())
}
