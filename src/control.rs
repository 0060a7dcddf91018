//! The control-channel contract: a session on a pub/sub bus that can carry
//! GRIP messages out of band and push publishes back toward the client.

use bytes::Bytes;
use tokio::sync::mpsc;

/// Events emitted by a control session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// A published message to deliver to the client as a single frame.
    /// `content_type == "binary"` selects a binary frame; anything else is
    /// delivered as text.
    Send { content_type: String, message: Bytes },
    /// Hand the client connection off: the origin leg is closed and the
    /// client is fed from the control channel only.
    Detach,
}

/// The receiving half of a control session's event stream.
pub type ControlEvents = mpsc::UnboundedReceiver<ControlEvent>;

/// One session on the pub/sub control bus.
pub trait ControlSession: Send {
    fn start(&mut self);

    /// Forward a GRIP message (the payload of an upstream `c:` frame, or a
    /// synthesized subscribe request) to the bus.
    fn send_grip_message(&mut self, message: Bytes);
}

/// A control session paired with the receiving half of its event stream.
pub struct ControlHandle {
    pub session: Box<dyn ControlSession>,
    pub events: ControlEvents,
}

impl ControlHandle {
    pub fn new(session: Box<dyn ControlSession>, events: ControlEvents) -> Self {
        Self { session, events }
    }
}

/// Creates control sessions. The channel prefix comes from the route entry
/// and is opaque to the proxy core.
pub trait ControlManager: Send + Sync {
    fn create_session(&self, channel_prefix: &str) -> ControlHandle;
}
