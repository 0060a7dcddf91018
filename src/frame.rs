//! WebSocket frame representation shared by all transports.
//!
//! A [`Frame`] is the unit the session forwards: a frame type, a payload,
//! and a `more` flag marking whether further fragments of the same message
//! follow. The session never reassembles messages; it routes fragments
//! individually while keeping a whole message on a single path.

use bytes::Bytes;

/// The type of a WebSocket frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Text,
    Binary,
    /// A non-head fragment of a fragmented message.
    Continuation,
    Ping,
    Pong,
    Close,
}

impl FrameType {
    /// Whether this frame carries message content, as opposed to being a
    /// protocol control frame (`Ping`, `Pong`, `Close`).
    pub fn is_content(self) -> bool {
        matches!(self, Self::Text | Self::Binary | Self::Continuation)
    }
}

/// A single WebSocket frame.
///
/// `more` is `false` on the final (or only) fragment of a message. Control
/// frames always have `more == false`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameType,
    pub data: Bytes,
    pub more: bool,
}

impl Frame {
    pub fn new(kind: FrameType, data: impl Into<Bytes>, more: bool) -> Self {
        Self { kind, data: data.into(), more }
    }

    /// A single-fragment text frame.
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self::new(FrameType::Text, data, false)
    }

    /// A single-fragment binary frame.
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(FrameType::Binary, data, false)
    }

    /// A close frame with an empty payload.
    pub fn close() -> Self {
        Self::new(FrameType::Close, Bytes::new(), false)
    }
}
