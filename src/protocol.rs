//! Frame codec for the terminal attach protocol.
//!
//! Wire format: `[tag: u8][payload: bytes]`, one frame per transport message.
//!
//! | tag           | payload                                  |
//! |---------------|------------------------------------------|
//! | `'0'` (0x30)  | raw terminal bytes                       |
//! | `'1'` (0x31)  | `colsLo colsHi rowsLo rowsHi`            |
//!
//! There is no length prefix: the transport message boundary is the frame
//! boundary. Frames are always sent as binary messages, but text messages are
//! decoded too so minimal peers can talk to us.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Tag byte of a data frame.
pub const TAG_DATA: u8 = b'0';

/// Tag byte of a resize frame.
pub const TAG_RESIZE: u8 = b'1';

/// Encoded size of a resize frame: tag plus two little-endian u16s.
pub const RESIZE_FRAME_LEN: usize = 5;

/// One message on the underlying transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Bytes),
}

impl WireMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text(_) => MessageKind::Text,
            Self::Binary(_) => MessageKind::Binary,
        }
    }

    /// Length in characters (text) or bytes (binary).
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.chars().count(),
            Self::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Binary(data) => data.is_empty(),
        }
    }
}

/// Transport message mode, used to label diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => f.write_str("text"),
            Self::Binary => f.write_str("binary"),
        }
    }
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Terminal I/O bytes, passed through unmodified.
    Data(Bytes),
    /// New terminal dimensions.
    Resize { cols: u16, rows: u16 },
}

impl Frame {
    pub fn encode(&self) -> WireMessage {
        match self {
            Self::Data(payload) => encode_data(payload),
            Self::Resize { cols, rows } => encode_resize(*cols, *rows),
        }
    }
}

/// Reasons an inbound message is rejected. Never fatal to a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid {kind} message: {len} units, need a tag and a payload")]
    TooShort { kind: MessageKind, len: usize },

    #[error("invalid {kind} message: unknown tag 0x{tag:02x}")]
    UnknownTag { kind: MessageKind, tag: u32 },

    #[error("invalid {kind} message: resize frame has {len} units, need 5")]
    TruncatedResize { kind: MessageKind, len: usize },

    #[error("invalid {kind} message: resize dimension U+{code:04X} does not fit in a byte")]
    NonByteChar { kind: MessageKind, code: u32 },
}

impl DecodeError {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::TooShort { kind, .. }
            | Self::UnknownTag { kind, .. }
            | Self::TruncatedResize { kind, .. }
            | Self::NonByteChar { kind, .. } => *kind,
        }
    }
}

/// Prefix `payload` with the data tag.
pub fn encode_data(payload: &[u8]) -> WireMessage {
    let mut buf = BytesMut::with_capacity(1 + payload.len());
    buf.put_u8(TAG_DATA);
    buf.put_slice(payload);
    WireMessage::Binary(buf.freeze())
}

/// Encode terminal dimensions as a five byte resize frame.
pub fn encode_resize(cols: u16, rows: u16) -> WireMessage {
    let mut buf = BytesMut::with_capacity(RESIZE_FRAME_LEN);
    buf.put_u8(TAG_RESIZE);
    buf.put_u16_le(cols);
    buf.put_u16_le(rows);
    WireMessage::Binary(buf.freeze())
}

/// Decode one transport message into a frame.
pub fn decode(message: &WireMessage) -> Result<Frame, DecodeError> {
    match message {
        WireMessage::Text(text) => decode_text(text),
        WireMessage::Binary(data) => decode_binary(data),
    }
}

fn decode_binary(data: &Bytes) -> Result<Frame, DecodeError> {
    let kind = MessageKind::Binary;
    if data.len() <= 1 {
        return Err(DecodeError::TooShort { kind, len: data.len() });
    }
    match data[0] {
        TAG_DATA => Ok(Frame::Data(data.slice(1..))),
        TAG_RESIZE => {
            if data.len() < RESIZE_FRAME_LEN {
                return Err(DecodeError::TruncatedResize { kind, len: data.len() });
            }
            Ok(Frame::Resize {
                cols: u16::from_le_bytes([data[1], data[2]]),
                rows: u16::from_le_bytes([data[3], data[4]]),
            })
        }
        tag => Err(DecodeError::UnknownTag { kind, tag: u32::from(tag) }),
    }
}

fn decode_text(text: &str) -> Result<Frame, DecodeError> {
    let kind = MessageKind::Text;
    let mut chars = text.chars();
    let Some(tag) = chars.next() else {
        return Err(DecodeError::TooShort { kind, len: 0 });
    };
    let rest = chars.as_str();
    if rest.is_empty() {
        return Err(DecodeError::TooShort { kind, len: 1 });
    }
    match tag {
        '0' => Ok(Frame::Data(Bytes::copy_from_slice(rest.as_bytes()))),
        '1' => {
            let mut dims = [0u8; 4];
            let mut found = 0;
            for (slot, c) in dims.iter_mut().zip(rest.chars()) {
                let code = u32::from(c);
                *slot = u8::try_from(code).map_err(|_| DecodeError::NonByteChar { kind, code })?;
                found += 1;
            }
            if found < dims.len() {
                return Err(DecodeError::TruncatedResize { kind, len: 1 + found });
            }
            Ok(Frame::Resize {
                cols: u16::from_le_bytes([dims[0], dims[1]]),
                rows: u16::from_le_bytes([dims[2], dims[3]]),
            })
        }
        other => Err(DecodeError::UnknownTag { kind, tag: u32::from(other) }),
    }
}
