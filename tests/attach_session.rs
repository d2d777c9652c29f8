//! Attach session behaviour against in-memory transport and terminal doubles.

mod common;

use bytes::Bytes;
use common::{FakeTerminal, FakeTransport};
use std::sync::Arc;
use std::time::Duration;
use wsterm::attach::{AttachError, AttachOptions, AttachSession, SessionState};
use wsterm::protocol::{self, WireMessage};
use wsterm::terminal::TerminalWidget;
use wsterm::transport::{ReadyState, Transport, TransportError};

fn active_session(
    transport: &Arc<FakeTransport>,
    terminal: &Arc<FakeTerminal>,
    bidirectional: bool,
) -> AttachSession {
    let session = AttachSession::new(
        transport.clone() as Arc<dyn Transport>,
        AttachOptions { bidirectional },
    );
    session.activate(terminal.clone()).unwrap();
    session
}

fn binary(bytes: &[u8]) -> WireMessage {
    WireMessage::Binary(Bytes::copy_from_slice(bytes))
}

#[test]
fn data_frame_is_written_to_terminal() {
    let transport = FakeTransport::open();
    let terminal = FakeTerminal::new();
    let session = active_session(&transport, &terminal, true);

    transport.emit_message(binary(&[0x30, 0x48, 0x49]));

    assert_eq!(terminal.written(), b"HI");
    assert!(terminal.resizes().is_empty());
    assert_eq!(session.stats().frames_received, 1);
}

#[test]
fn resize_frame_resizes_terminal() {
    let transport = FakeTransport::open();
    let terminal = FakeTerminal::new();
    let _session = active_session(&transport, &terminal, true);

    transport.emit_message(binary(&[0x31, 80, 0, 24, 0]));

    assert_eq!(terminal.resizes(), vec![(80, 24)]);
    assert!(terminal.written().is_empty());
}

#[test]
fn text_frames_are_accepted() {
    let transport = FakeTransport::open();
    let terminal = FakeTerminal::new();
    let _session = active_session(&transport, &terminal, true);

    transport.emit_message(WireMessage::Text("0hello".to_string()));
    transport.emit_message(WireMessage::Text("1\u{50}\u{00}\u{19}\u{00}".to_string()));

    assert_eq!(terminal.written(), b"hello");
    assert_eq!(terminal.resizes(), vec![(80, 25)]);
}

#[test]
fn local_data_is_sent_as_data_frame() {
    let transport = FakeTransport::open();
    let terminal = FakeTerminal::new();
    let session = active_session(&transport, &terminal, true);

    terminal.type_data("ls\n").unwrap();

    assert_eq!(transport.sent(), vec![binary(b"0ls\n")]);
    assert_eq!(session.stats().frames_sent, 1);
}

#[test]
fn local_binary_is_masked_to_bytes() {
    let transport = FakeTransport::open();
    let terminal = FakeTerminal::new();
    let _session = active_session(&transport, &terminal, true);

    terminal.type_binary("\u{1b}\u{ff}\u{100}").unwrap();

    assert_eq!(transport.sent(), vec![binary(&[0x30, 0x1b, 0xff, 0x00])]);
}

#[test]
fn local_resize_is_sent_as_resize_frame() {
    let transport = FakeTransport::open();
    let terminal = FakeTerminal::new();
    let _session = active_session(&transport, &terminal, true);

    terminal.resize_local(300, 2).unwrap();

    assert_eq!(transport.sent(), vec![binary(&[0x31, 0x2c, 0x01, 0x02, 0x00])]);
}

#[test]
fn resize_while_closing_is_dropped() {
    let transport = FakeTransport::open();
    let terminal = FakeTerminal::new();
    let session = active_session(&transport, &terminal, true);

    transport.set_state(ReadyState::Closing);
    terminal.resize_local(100, 40).unwrap();
    terminal.type_data("x").unwrap();

    assert!(transport.sent().is_empty());
    let stats = session.stats();
    assert_eq!(stats.dropped_sends, 2);
    assert_eq!(stats.frames_sent, 0);
}

#[test]
fn send_while_connecting_is_an_error() {
    let transport = FakeTransport::new(ReadyState::Connecting);
    let terminal = FakeTerminal::new();
    let session = active_session(&transport, &terminal, true);

    let err = terminal.type_data("x").unwrap_err();
    assert!(matches!(err, AttachError::NotYetOpen));
    assert!(matches!(session.send_resize(1, 1), Err(AttachError::NotYetOpen)));
    assert!(transport.sent().is_empty());
}

#[test]
fn send_while_closed_is_an_error() {
    let transport = FakeTransport::open();
    let session = AttachSession::new(transport.clone(), AttachOptions::default());
    transport.set_state(ReadyState::Closed);

    assert!(matches!(
        session.send_data(b"x"),
        Err(AttachError::TransportClosed)
    ));
    assert!(transport.sent().is_empty());
}

#[test]
fn close_disposes_and_unsubscribes_everything() {
    let transport = FakeTransport::open();
    let terminal = FakeTerminal::new();
    let session = active_session(&transport, &terminal, true);

    assert_eq!(transport.listener_counts(), (1, 1, 1));
    assert_eq!(terminal.listener_counts(), (1, 1, 1));

    transport.emit_close();

    assert_eq!(session.state(), SessionState::Disposed);
    assert!(session.is_disposed());
    assert_eq!(transport.listener_counts(), (0, 0, 0));
    assert_eq!(terminal.listener_counts(), (0, 0, 0));
}

#[test]
fn transport_error_disposes() {
    let transport = FakeTransport::open();
    let terminal = FakeTerminal::new();
    let session = active_session(&transport, &terminal, true);

    transport.emit_error(TransportError::WebSocket("reset".to_string()));

    assert!(session.is_disposed());
    assert_eq!(transport.listener_counts(), (0, 0, 0));
    assert_eq!(terminal.listener_counts(), (0, 0, 0));
}

#[test]
fn receive_only_registers_no_local_listeners() {
    let transport = FakeTransport::open();
    let terminal = FakeTerminal::new();
    let session = active_session(&transport, &terminal, false);

    assert!(!session.is_bidirectional());
    assert_eq!(transport.listener_counts(), (1, 1, 1));
    assert_eq!(terminal.listener_counts(), (0, 0, 0));

    terminal.type_data("ignored").unwrap();
    terminal.resize_local(10, 10).unwrap();
    assert!(transport.sent().is_empty());

    transport.emit_message(binary(b"0out"));
    assert_eq!(terminal.written(), b"out");
}

#[test]
fn dispose_is_idempotent() {
    let transport = FakeTransport::open();
    let terminal = FakeTerminal::new();
    let session = active_session(&transport, &terminal, true);

    session.dispose();
    session.dispose();
    transport.emit_close();

    assert_eq!(session.state(), SessionState::Disposed);
    assert_eq!(transport.listener_counts(), (0, 0, 0));
    assert_eq!(terminal.listener_counts(), (0, 0, 0));
}

#[test]
fn nothing_happens_after_dispose() {
    let transport = FakeTransport::open();
    let terminal = FakeTerminal::new();
    let session = active_session(&transport, &terminal, true);
    session.dispose();

    transport.emit_message(binary(b"0late"));
    terminal.type_data("late").unwrap();
    assert!(matches!(
        session.send_data(b"late"),
        Err(AttachError::Disposed)
    ));
    assert!(matches!(
        session.send_resize(80, 24),
        Err(AttachError::Disposed)
    ));

    assert!(terminal.written().is_empty());
    assert!(transport.sent().is_empty());
}

#[test]
fn message_in_flight_at_dispose_is_discarded() {
    let transport = FakeTransport::open();
    let terminal = FakeTerminal::new();
    let session = Arc::new(AttachSession::new(
        transport.clone() as Arc<dyn Transport>,
        AttachOptions::default(),
    ));

    // Registered first, so it runs before the session's own handler in the
    // same emit pass.
    let weak = Arc::downgrade(&session);
    let _disposer = transport.on_message(Arc::new(move |_: &WireMessage| {
        if let Some(session) = weak.upgrade() {
            session.dispose();
        }
    }));
    session.activate(terminal.clone()).unwrap();

    transport.emit_message(binary(b"0late"));

    assert!(session.is_disposed());
    assert!(terminal.written().is_empty());
    assert_eq!(session.stats().frames_received, 0);
}

#[test]
fn local_input_in_flight_at_dispose_is_discarded() {
    let transport = FakeTransport::open();
    let terminal = FakeTerminal::new();
    let session = Arc::new(AttachSession::new(
        transport.clone() as Arc<dyn Transport>,
        AttachOptions::default(),
    ));

    let weak = Arc::downgrade(&session);
    let _disposer = terminal.on_data(Arc::new(move |_: &str| {
        if let Some(session) = weak.upgrade() {
            session.dispose();
        }
        Ok(())
    }));
    session.activate(terminal.clone()).unwrap();

    terminal.type_data("late").unwrap();

    assert!(session.is_disposed());
    assert!(transport.sent().is_empty());
    assert_eq!(session.stats().frames_sent, 0);
}

#[test]
fn dropping_the_session_disposes_it() {
    let transport = FakeTransport::open();
    let terminal = FakeTerminal::new();
    let session = active_session(&transport, &terminal, true);

    drop(session);

    assert_eq!(transport.listener_counts(), (0, 0, 0));
    assert_eq!(terminal.listener_counts(), (0, 0, 0));
}

#[test]
fn invalid_frames_are_counted_and_dropped() {
    let transport = FakeTransport::open();
    let terminal = FakeTerminal::new();
    let session = active_session(&transport, &terminal, true);

    transport.emit_message(binary(b"0"));
    transport.emit_message(binary(b"9abc"));
    transport.emit_message(binary(&[0x31, 80, 0, 24]));
    transport.emit_message(WireMessage::Text(String::new()));

    let stats = session.stats();
    assert_eq!(stats.invalid_frames, 4);
    assert_eq!(stats.frames_received, 0);
    assert!(terminal.written().is_empty());
    assert!(terminal.resizes().is_empty());
    assert_eq!(session.state(), SessionState::Active);
}

#[test]
fn activate_twice_is_rejected() {
    let transport = FakeTransport::open();
    let terminal = FakeTerminal::new();
    let session = active_session(&transport, &terminal, true);

    let err = session.activate(terminal.clone()).unwrap_err();
    assert!(matches!(err, AttachError::AlreadyActivated));
    assert_eq!(terminal.listener_counts(), (1, 1, 1));
}

#[test]
fn activate_after_dispose_is_rejected() {
    let transport = FakeTransport::open();
    let terminal = FakeTerminal::new();
    let session = AttachSession::new(transport.clone(), AttachOptions::default());
    assert_eq!(session.state(), SessionState::Created);

    session.dispose();
    let err = session.activate(terminal.clone()).unwrap_err();
    assert!(matches!(err, AttachError::Disposed));
    assert_eq!(transport.listener_counts(), (0, 0, 0));
}

#[test]
fn encoded_frames_match_wire_layout() {
    assert_eq!(protocol::encode_data(b"ls\n"), binary(b"0ls\n"));
    assert_eq!(protocol::encode_resize(100, 40), binary(&[0x31, 100, 0, 40, 0]));
}

#[tokio::test]
async fn closed_resolves_after_transport_close() {
    let transport = FakeTransport::open();
    let terminal = FakeTerminal::new();
    let session = active_session(&transport, &terminal, true);

    let closer = transport.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        closer.emit_close();
    });

    tokio::time::timeout(Duration::from_secs(2), session.closed())
        .await
        .expect("session should close");
    assert!(session.is_disposed());
}

/// Fires its close listener the moment it is registered, as if the socket
/// dropped while the session was still activating.
struct CloseOnSubscribe(Arc<FakeTransport>);

impl Transport for CloseOnSubscribe {
    fn ready_state(&self) -> ReadyState {
        self.0.ready_state()
    }

    fn send(&self, message: WireMessage) -> Result<(), TransportError> {
        self.0.send(message)
    }

    fn on_message(
        &self,
        listener: Arc<wsterm::transport::MessageListener>,
    ) -> wsterm::listeners::Subscription {
        self.0.on_message(listener)
    }

    fn on_close(
        &self,
        listener: Arc<wsterm::transport::CloseListener>,
    ) -> wsterm::listeners::Subscription {
        let subscription = self.0.on_close(listener.clone());
        listener();
        subscription
    }

    fn on_error(
        &self,
        listener: Arc<wsterm::transport::ErrorListener>,
    ) -> wsterm::listeners::Subscription {
        self.0.on_error(listener)
    }
}

#[test]
fn close_during_activation_tears_down_partial_registration() {
    let inner = FakeTransport::open();
    let terminal = FakeTerminal::new();
    let session = AttachSession::new(
        Arc::new(CloseOnSubscribe(inner.clone())),
        AttachOptions::default(),
    );

    session.activate(terminal.clone()).unwrap();

    assert_eq!(session.state(), SessionState::Disposed);
    assert_eq!(inner.listener_counts(), (0, 0, 0));
    assert_eq!(terminal.listener_counts(), (0, 0, 0));
}
