//! In-memory transports for testing and embedding.
//!
//! [`client`] and [`origin`] build channel-backed sockets whose far side is
//! a [`LocalPeer`]: a driver handle that injects frames and lifecycle
//! signals and inspects everything the session did to the socket. The
//! session under test cannot tell these apart from real transports, which
//! makes the full state machine drivable without any networking.
//!
//! [`LocalControlManager`] plays the same role for the control bus.
//!
//! The peer never emits signals on its own: a `close()` issued by the
//! session, for example, is only completed once the driver answers with
//! [`LocalPeer::closed`]. Tests stay in charge of every transition.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use url::Url;

use crate::control::{ControlEvent, ControlHandle, ControlManager, ControlSession};
use crate::frame::Frame;
use crate::socket::{ErrorCondition, Socket, SocketEvent, SocketHandle, SocketState};

/// A handshake response issued by the session on a client-role socket.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalResponse {
    Success {
        reason: String,
        headers: HeaderMap,
    },
    Error {
        code: u16,
        reason: String,
        headers: HeaderMap,
        body: Bytes,
    },
}

#[derive(Debug, Clone)]
struct ResponseMeta {
    code: u16,
    reason: String,
    headers: HeaderMap,
    body: Bytes,
}

#[derive(Debug)]
struct Inner {
    state: SocketState,
    error: ErrorCondition,
    request: Option<(Url, HeaderMap)>,
    peer_address: Option<IpAddr>,
    /// Handshake response supplied by the peer (origin role).
    response: Option<ResponseMeta>,
    /// Handshake response issued by the session (client role).
    sent_response: Option<LocalResponse>,
    incoming: VecDeque<Frame>,
    written: Vec<Frame>,
    connect_host: Option<String>,
    connect_port: Option<u16>,
    ignore_policies: bool,
    ignore_tls_errors: bool,
    close_requested: bool,
}

impl Inner {
    fn new(state: SocketState, request: Option<(Url, HeaderMap)>, peer_address: Option<IpAddr>) -> Self {
        Self {
            state,
            error: ErrorCondition::Generic,
            request,
            peer_address,
            response: None,
            sent_response: None,
            incoming: VecDeque::new(),
            written: Vec::new(),
            connect_host: None,
            connect_port: None,
            ignore_policies: false,
            ignore_tls_errors: false,
            close_requested: false,
        }
    }
}

fn placeholder_uri() -> Url {
    Url::parse("ws://localhost/").expect("static uri")
}

/// The socket half of an in-memory connection.
pub struct LocalSocket {
    inner: Arc<Mutex<Inner>>,
}

impl Socket for LocalSocket {
    fn start(&mut self, uri: Url, headers: HeaderMap) {
        let mut inner = self.inner.lock();
        inner.request = Some((uri, headers));
        inner.state = SocketState::Connecting;
    }

    fn set_connect_host(&mut self, host: &str) {
        self.inner.lock().connect_host = Some(host.to_string());
    }

    fn set_connect_port(&mut self, port: u16) {
        self.inner.lock().connect_port = Some(port);
    }

    fn set_ignore_policies(&mut self, ignore: bool) {
        self.inner.lock().ignore_policies = ignore;
    }

    fn set_ignore_tls_errors(&mut self, ignore: bool) {
        self.inner.lock().ignore_tls_errors = ignore;
    }

    fn state(&self) -> SocketState {
        self.inner.lock().state
    }

    fn error_condition(&self) -> ErrorCondition {
        self.inner.lock().error
    }

    fn request_uri(&self) -> Url {
        self.inner
            .lock()
            .request
            .as_ref()
            .map(|(uri, _)| uri.clone())
            .unwrap_or_else(placeholder_uri)
    }

    fn request_headers(&self) -> HeaderMap {
        self.inner
            .lock()
            .request
            .as_ref()
            .map(|(_, headers)| headers.clone())
            .unwrap_or_default()
    }

    fn peer_address(&self) -> Option<IpAddr> {
        self.inner.lock().peer_address
    }

    fn response_code(&self) -> u16 {
        self.inner.lock().response.as_ref().map(|r| r.code).unwrap_or(0)
    }

    fn response_reason(&self) -> String {
        self.inner
            .lock()
            .response
            .as_ref()
            .map(|r| r.reason.clone())
            .unwrap_or_default()
    }

    fn response_headers(&self) -> HeaderMap {
        self.inner
            .lock()
            .response
            .as_ref()
            .map(|r| r.headers.clone())
            .unwrap_or_default()
    }

    fn response_body(&self) -> Bytes {
        self.inner
            .lock()
            .response
            .as_ref()
            .map(|r| r.body.clone())
            .unwrap_or_default()
    }

    fn respond_success(&mut self, reason: &str, headers: HeaderMap) {
        self.inner.lock().sent_response = Some(LocalResponse::Success {
            reason: reason.to_string(),
            headers,
        });
    }

    fn respond_error(&mut self, code: u16, reason: &str, headers: HeaderMap, body: Bytes) {
        let mut inner = self.inner.lock();
        inner.sent_response = Some(LocalResponse::Error {
            code,
            reason: reason.to_string(),
            headers,
            body,
        });
        inner.state = SocketState::Closing;
    }

    fn frames_available(&self) -> usize {
        self.inner.lock().incoming.len()
    }

    fn read_frame(&mut self) -> Option<Frame> {
        self.inner.lock().incoming.pop_front()
    }

    fn write_frame(&mut self, frame: Frame) {
        self.inner.lock().written.push(frame);
    }

    fn close(&mut self) {
        let mut inner = self.inner.lock();
        inner.close_requested = true;
        inner.state = SocketState::Closing;
    }
}

/// The driver half of an in-memory connection.
#[derive(Clone)]
pub struct LocalPeer {
    inner: Arc<Mutex<Inner>>,
    events: mpsc::UnboundedSender<SocketEvent>,
}

impl LocalPeer {
    /// Complete a pending origin handshake successfully.
    pub fn accept(&self, reason: &str, headers: HeaderMap) {
        {
            let mut inner = self.inner.lock();
            inner.response = Some(ResponseMeta {
                code: 101,
                reason: reason.to_string(),
                headers,
                body: Bytes::new(),
            });
            inner.state = SocketState::Connected;
        }
        let _ = self.events.send(SocketEvent::Connected);
    }

    /// Answer a pending origin handshake with an HTTP error.
    pub fn reject(&self, code: u16, reason: &str, headers: HeaderMap, body: impl Into<Bytes>) {
        {
            let mut inner = self.inner.lock();
            inner.response = Some(ResponseMeta {
                code,
                reason: reason.to_string(),
                headers,
                body: body.into(),
            });
            inner.error = ErrorCondition::Rejected;
            inner.state = SocketState::Closed;
        }
        let _ = self.events.send(SocketEvent::Error);
    }

    /// Fail the connection with the given condition.
    pub fn fail(&self, condition: ErrorCondition) {
        {
            let mut inner = self.inner.lock();
            inner.error = condition;
            inner.state = SocketState::Closed;
        }
        let _ = self.events.send(SocketEvent::Error);
    }

    /// Hand a frame to the socket and signal readiness.
    pub fn deliver(&self, frame: Frame) {
        self.inner.lock().incoming.push_back(frame);
        let _ = self.events.send(SocketEvent::ReadyRead);
    }

    /// Acknowledge `count` written frames as flushed.
    pub fn acknowledge(&self, count: usize) {
        let _ = self.events.send(SocketEvent::FramesWritten(count));
    }

    /// Signal that the peer started closing.
    pub fn peer_close(&self) {
        let _ = self.events.send(SocketEvent::PeerClosed);
    }

    /// Complete the close: the connection is gone.
    pub fn closed(&self) {
        self.inner.lock().state = SocketState::Closed;
        let _ = self.events.send(SocketEvent::Closed);
    }

    /// Frames the session wrote to this socket.
    pub fn written(&self) -> Vec<Frame> {
        self.inner.lock().written.clone()
    }

    pub fn written_count(&self) -> usize {
        self.inner.lock().written.len()
    }

    /// The handshake response the session issued, if any.
    pub fn response(&self) -> Option<LocalResponse> {
        self.inner.lock().sent_response.clone()
    }

    /// Whether the session asked this socket to close.
    pub fn close_requested(&self) -> bool {
        self.inner.lock().close_requested
    }

    /// The `start` call recorded on an origin-role socket.
    pub fn started(&self) -> Option<(Url, HeaderMap)> {
        self.inner.lock().request.clone()
    }

    /// The TCP endpoint configured before `start`.
    pub fn connect_target(&self) -> Option<(String, u16)> {
        let inner = self.inner.lock();
        match (&inner.connect_host, inner.connect_port) {
            (Some(host), Some(port)) => Some((host.clone(), port)),
            _ => None,
        }
    }

    pub fn ignore_policies(&self) -> bool {
        self.inner.lock().ignore_policies
    }

    pub fn ignore_tls_errors(&self) -> bool {
        self.inner.lock().ignore_tls_errors
    }

    pub fn state(&self) -> SocketState {
        self.inner.lock().state
    }
}

/// Build an accepted client-role socket carrying the given request data.
pub fn client(
    uri: Url,
    headers: HeaderMap,
    peer_address: Option<IpAddr>,
) -> (SocketHandle, LocalPeer) {
    let inner = Arc::new(Mutex::new(Inner::new(
        SocketState::Connected,
        Some((uri, headers)),
        peer_address,
    )));
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let socket = LocalSocket { inner: inner.clone() };
    let peer = LocalPeer { inner, events: events_tx };

    (SocketHandle::new(Box::new(socket), events_rx), peer)
}

/// Build an idle origin-role socket that records its `start` call and waits
/// for the peer to accept, reject, or fail it.
pub fn origin() -> (SocketHandle, LocalPeer) {
    let inner = Arc::new(Mutex::new(Inner::new(SocketState::Idle, None, None)));
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let socket = LocalSocket { inner: inner.clone() };
    let peer = LocalPeer { inner, events: events_tx };

    (SocketHandle::new(Box::new(socket), events_rx), peer)
}

#[derive(Debug)]
struct ControlState {
    channel_prefix: String,
    started: bool,
    sent: Vec<Bytes>,
}

struct LocalControlSession {
    state: Arc<Mutex<ControlState>>,
}

impl ControlSession for LocalControlSession {
    fn start(&mut self) {
        self.state.lock().started = true;
    }

    fn send_grip_message(&mut self, message: Bytes) {
        self.state.lock().sent.push(message);
    }
}

/// Driver handle for one fake control session.
#[derive(Clone)]
pub struct LocalControlPeer {
    state: Arc<Mutex<ControlState>>,
    events: mpsc::UnboundedSender<ControlEvent>,
}

impl LocalControlPeer {
    pub fn started(&self) -> bool {
        self.state.lock().started
    }

    pub fn channel_prefix(&self) -> String {
        self.state.lock().channel_prefix.clone()
    }

    /// GRIP messages the session forwarded to the bus.
    pub fn sent(&self) -> Vec<Bytes> {
        self.state.lock().sent.clone()
    }

    /// Emit a publish toward the client.
    pub fn send_event(&self, content_type: &str, message: impl Into<Bytes>) {
        let _ = self.events.send(ControlEvent::Send {
            content_type: content_type.to_string(),
            message: message.into(),
        });
    }

    /// Emit a detach.
    pub fn detach_event(&self) {
        let _ = self.events.send(ControlEvent::Detach);
    }
}

/// A [`ControlManager`] that records every session it creates.
#[derive(Clone, Default)]
pub struct LocalControlManager {
    sessions: Arc<Mutex<Vec<LocalControlPeer>>>,
}

impl LocalControlManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// The most recently created session's driver handle.
    pub fn last_session(&self) -> Option<LocalControlPeer> {
        self.sessions.lock().last().cloned()
    }
}

impl ControlManager for LocalControlManager {
    fn create_session(&self, channel_prefix: &str) -> ControlHandle {
        let state = Arc::new(Mutex::new(ControlState {
            channel_prefix: channel_prefix.to_string(),
            started: false,
            sent: Vec::new(),
        }));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let peer = LocalControlPeer {
            state: state.clone(),
            events: events_tx,
        };
        self.sessions.lock().push(peer);

        ControlHandle::new(Box::new(LocalControlSession { state }), events_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameType;

    #[tokio::test]
    async fn client_socket_carries_request_data() {
        let uri = Url::parse("ws://example.com/chat").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-test", http::HeaderValue::from_static("1"));

        let (handle, _peer) = client(uri.clone(), headers, Some("10.1.1.1".parse().unwrap()));
        assert_eq!(handle.socket.request_uri(), uri);
        assert_eq!(handle.socket.request_headers().get("x-test").unwrap(), "1");
        assert_eq!(handle.socket.peer_address(), Some("10.1.1.1".parse().unwrap()));
        assert_eq!(handle.socket.state(), SocketState::Connected);
    }

    #[tokio::test]
    async fn delivered_frames_are_readable_in_order() {
        let (mut handle, peer) = client(placeholder_uri(), HeaderMap::new(), None);

        peer.deliver(Frame::text("a"));
        peer.deliver(Frame::text("b"));

        assert_eq!(handle.events.recv().await, Some(SocketEvent::ReadyRead));
        assert_eq!(handle.socket.frames_available(), 2);
        assert_eq!(&handle.socket.read_frame().unwrap().data[..], b"a");
        assert_eq!(&handle.socket.read_frame().unwrap().data[..], b"b");
        assert!(handle.socket.read_frame().is_none());
    }

    #[tokio::test]
    async fn origin_records_start_and_settings() {
        let (mut handle, peer) = origin();
        assert_eq!(handle.socket.state(), SocketState::Idle);

        handle.socket.set_connect_host("backend");
        handle.socket.set_connect_port(8080);
        handle.socket.set_ignore_tls_errors(true);
        handle.socket.start(Url::parse("ws://h/p").unwrap(), HeaderMap::new());

        assert_eq!(handle.socket.state(), SocketState::Connecting);
        assert_eq!(peer.connect_target(), Some(("backend".to_string(), 8080)));
        assert!(peer.ignore_tls_errors());
        assert_eq!(peer.started().unwrap().0.as_str(), "ws://h/p");

        peer.accept("Switching Protocols", HeaderMap::new());
        assert_eq!(handle.events.recv().await, Some(SocketEvent::Connected));
        assert_eq!(handle.socket.response_code(), 101);
    }

    #[tokio::test]
    async fn rejection_exposes_response_data() {
        let (mut handle, peer) = origin();
        handle.socket.start(Url::parse("ws://h/p").unwrap(), HeaderMap::new());

        peer.reject(401, "Unauthorized", HeaderMap::new(), "nope");
        assert_eq!(handle.events.recv().await, Some(SocketEvent::Error));
        assert_eq!(handle.socket.error_condition(), ErrorCondition::Rejected);
        assert_eq!(handle.socket.response_code(), 401);
        assert_eq!(&handle.socket.response_body()[..], b"nope");
    }

    #[tokio::test]
    async fn session_responses_are_recorded() {
        let (mut handle, peer) = client(placeholder_uri(), HeaderMap::new(), None);

        handle.socket.respond_error(502, "Bad Gateway", HeaderMap::new(), Bytes::from("oops"));
        match peer.response() {
            Some(LocalResponse::Error { code, body, .. }) => {
                assert_eq!(code, 502);
                assert_eq!(&body[..], b"oops");
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn written_frames_and_close_are_visible() {
        let (mut handle, peer) = client(placeholder_uri(), HeaderMap::new(), None);

        handle.socket.write_frame(Frame::binary(vec![1, 2]));
        handle.socket.close();

        assert_eq!(peer.written_count(), 1);
        assert_eq!(peer.written()[0].kind, FrameType::Binary);
        assert!(peer.close_requested());
        assert_eq!(peer.state(), SocketState::Closing);
    }

    #[tokio::test]
    async fn control_manager_tracks_sessions() {
        let manager = LocalControlManager::new();
        assert_eq!(manager.session_count(), 0);

        let mut handle = manager.create_session("prefix-");
        let peer = manager.last_session().unwrap();
        assert_eq!(manager.session_count(), 1);
        assert_eq!(peer.channel_prefix(), "prefix-");
        assert!(!peer.started());

        handle.session.start();
        handle.session.send_grip_message(Bytes::from_static(b"payload"));
        assert!(peer.started());
        assert_eq!(peer.sent(), vec![Bytes::from_static(b"payload")]);

        peer.send_event("text", "hello");
        assert_eq!(
            handle.events.recv().await,
            Some(ControlEvent::Send {
                content_type: "text".into(),
                message: Bytes::from_static(b"hello"),
            })
        );
    }
}
