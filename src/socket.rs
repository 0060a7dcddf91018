//! The transport contract between a session and its WebSocket endpoints.
//!
//! A [`Socket`] is a connection-oriented WebSocket endpoint: it buffers
//! received frames for the session to pull, accepts frames to send, and
//! reports lifecycle changes through a stream of [`SocketEvent`]s. None of
//! the operations block; readiness is signalled, not awaited.
//!
//! Both legs of a proxied connection share this shape. The client leg is
//! handed to the session already accepted; origin legs are produced on
//! demand by a [`Connector`] and then driven through `start`.

use std::net::IpAddr;

use bytes::Bytes;
use http::HeaderMap;
use tokio::sync::mpsc;
use url::Url;

use crate::frame::Frame;

/// Lifecycle signals emitted by a [`Socket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEvent {
    /// The outbound handshake completed; response data is available.
    Connected,
    /// One or more frames are available to read.
    ReadyRead,
    /// This many previously written frames were flushed to the peer.
    FramesWritten(usize),
    /// The peer started closing the connection.
    PeerClosed,
    /// The connection is fully closed.
    Closed,
    /// The connection failed; see [`Socket::error_condition`].
    Error,
}

/// The receiving half of a socket's event stream.
pub type SocketEvents = mpsc::UnboundedReceiver<SocketEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Idle,
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// Why a socket reported [`SocketEvent::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCondition {
    /// The transport could not reach the peer.
    Connect,
    /// The connection attempt timed out.
    ConnectTimeout,
    /// TLS negotiation failed.
    Tls,
    /// The peer answered the handshake with an HTTP error; the response is
    /// available through the `response_*` accessors.
    Rejected,
    /// Anything else.
    Generic,
}

/// A non-blocking, event-driven WebSocket endpoint.
pub trait Socket: Send {
    /// Begin the outbound handshake to `uri` with the given request
    /// headers. Completion is reported as [`SocketEvent::Connected`] or
    /// [`SocketEvent::Error`].
    fn start(&mut self, uri: Url, headers: HeaderMap);

    /// Override the host used for the TCP connection (the request URI keeps
    /// its own authority).
    fn set_connect_host(&mut self, host: &str);
    fn set_connect_port(&mut self, port: u16);

    /// Skip origin policy checks for this connection.
    fn set_ignore_policies(&mut self, ignore: bool);

    /// Accept invalid TLS certificates for this connection.
    fn set_ignore_tls_errors(&mut self, ignore: bool);

    fn state(&self) -> SocketState;
    fn error_condition(&self) -> ErrorCondition;

    fn request_uri(&self) -> Url;
    fn request_headers(&self) -> HeaderMap;
    fn peer_address(&self) -> Option<IpAddr>;

    fn response_code(&self) -> u16;
    fn response_reason(&self) -> String;
    fn response_headers(&self) -> HeaderMap;
    fn response_body(&self) -> Bytes;

    /// Complete an inbound handshake successfully (client leg only).
    fn respond_success(&mut self, reason: &str, headers: HeaderMap);

    /// Complete an inbound handshake with an HTTP error (client leg only).
    fn respond_error(&mut self, code: u16, reason: &str, headers: HeaderMap, body: Bytes);

    /// Number of received frames waiting to be read.
    fn frames_available(&self) -> usize;

    /// Pop the next received frame, if any.
    fn read_frame(&mut self) -> Option<Frame>;

    /// Queue a frame for sending. Flushes are acknowledged via
    /// [`SocketEvent::FramesWritten`].
    fn write_frame(&mut self, frame: Frame);

    /// Begin the close handshake.
    fn close(&mut self);
}

/// A socket paired with the receiving half of its event stream. The two are
/// created together and released together.
pub struct SocketHandle {
    pub socket: Box<dyn Socket>,
    pub events: SocketEvents,
}

impl SocketHandle {
    pub fn new(socket: Box<dyn Socket>, events: SocketEvents) -> Self {
        Self { socket, events }
    }
}

/// Produces origin-side sockets for outbound connections.
pub trait Connector: Send + Sync {
    fn create_socket(&self) -> SocketHandle;
}
