//! Origin-side transport backed by tokio-tungstenite.
//!
//! [`WsConnector`] produces [`Socket`]s for outbound origin connections.
//! `start` spawns a connection task that dials the configured TCP endpoint,
//! runs the WebSocket client handshake (TLS when the URI scheme is `wss`),
//! and then pumps messages between the network and the socket's frame
//! queues. It must therefore be used from within a tokio runtime.
//!
//! tungstenite reassembles fragmented messages, so frames read from this
//! transport always have `more == false`. In the write direction, fragments
//! are coalesced until the final one and sent as a single message; the
//! flush acknowledgement then covers all coalesced fragments at once.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use http::header::{
    HeaderName, CONNECTION, HOST, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::HeaderMap;
use log::debug;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::frame::{Frame, FrameType};
use crate::socket::{
    Connector, ErrorCondition, Socket, SocketEvent, SocketHandle, SocketState,
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Creates tungstenite-backed origin sockets.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new() -> Self {
        Self { connect_timeout: DEFAULT_CONNECT_TIMEOUT }
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for WsConnector {
    fn create_socket(&self) -> SocketHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let socket = OriginSocket {
            shared: Arc::new(Mutex::new(Shared::new())),
            events: events_tx,
            commands: commands_tx,
            commands_rx: Some(commands_rx),
            connect_timeout: self.connect_timeout,
        };

        SocketHandle::new(Box::new(socket), events_rx)
    }
}

enum Command {
    Frame(Frame),
    Close,
}

#[derive(Debug, Clone)]
struct ResponseMeta {
    code: u16,
    reason: String,
    headers: HeaderMap,
    body: Bytes,
}

struct Shared {
    state: SocketState,
    error: ErrorCondition,
    request: Option<(url::Url, HeaderMap)>,
    response: Option<ResponseMeta>,
    incoming: VecDeque<Frame>,
    connect_host: Option<String>,
    connect_port: Option<u16>,
    ignore_policies: bool,
    ignore_tls_errors: bool,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: SocketState::Idle,
            error: ErrorCondition::Generic,
            request: None,
            response: None,
            incoming: VecDeque::new(),
            connect_host: None,
            connect_port: None,
            ignore_policies: false,
            ignore_tls_errors: false,
        }
    }
}

struct OriginSocket {
    shared: Arc<Mutex<Shared>>,
    events: mpsc::UnboundedSender<SocketEvent>,
    commands: mpsc::UnboundedSender<Command>,
    commands_rx: Option<mpsc::UnboundedReceiver<Command>>,
    connect_timeout: Duration,
}

impl Socket for OriginSocket {
    fn start(&mut self, uri: url::Url, headers: HeaderMap) {
        {
            let mut shared = self.shared.lock();
            shared.request = Some((uri, headers));
            shared.state = SocketState::Connecting;
        }

        if let Some(commands_rx) = self.commands_rx.take() {
            tokio::spawn(run_connection(
                self.shared.clone(),
                self.events.clone(),
                commands_rx,
                self.connect_timeout,
            ));
        }
    }

    fn set_connect_host(&mut self, host: &str) {
        self.shared.lock().connect_host = Some(host.to_string());
    }

    fn set_connect_port(&mut self, port: u16) {
        self.shared.lock().connect_port = Some(port);
    }

    fn set_ignore_policies(&mut self, ignore: bool) {
        self.shared.lock().ignore_policies = ignore;
    }

    fn set_ignore_tls_errors(&mut self, ignore: bool) {
        self.shared.lock().ignore_tls_errors = ignore;
    }

    fn state(&self) -> SocketState {
        self.shared.lock().state
    }

    fn error_condition(&self) -> ErrorCondition {
        self.shared.lock().error
    }

    fn request_uri(&self) -> url::Url {
        self.shared
            .lock()
            .request
            .as_ref()
            .map(|(uri, _)| uri.clone())
            .unwrap_or_else(|| url::Url::parse("ws://localhost/").expect("static uri"))
    }

    fn request_headers(&self) -> HeaderMap {
        self.shared
            .lock()
            .request
            .as_ref()
            .map(|(_, headers)| headers.clone())
            .unwrap_or_default()
    }

    fn peer_address(&self) -> Option<IpAddr> {
        None
    }

    fn response_code(&self) -> u16 {
        self.shared.lock().response.as_ref().map(|r| r.code).unwrap_or(0)
    }

    fn response_reason(&self) -> String {
        self.shared
            .lock()
            .response
            .as_ref()
            .map(|r| r.reason.clone())
            .unwrap_or_default()
    }

    fn response_headers(&self) -> HeaderMap {
        self.shared
            .lock()
            .response
            .as_ref()
            .map(|r| r.headers.clone())
            .unwrap_or_default()
    }

    fn response_body(&self) -> Bytes {
        self.shared
            .lock()
            .response
            .as_ref()
            .map(|r| r.body.clone())
            .unwrap_or_default()
    }

    fn respond_success(&mut self, _reason: &str, _headers: HeaderMap) {
        // client-role operation; an origin socket never answers a handshake
    }

    fn respond_error(&mut self, _code: u16, _reason: &str, _headers: HeaderMap, _body: Bytes) {
        // client-role operation; an origin socket never answers a handshake
    }

    fn frames_available(&self) -> usize {
        self.shared.lock().incoming.len()
    }

    fn read_frame(&mut self) -> Option<Frame> {
        self.shared.lock().incoming.pop_front()
    }

    fn write_frame(&mut self, frame: Frame) {
        let _ = self.commands.send(Command::Frame(frame));
    }

    fn close(&mut self) {
        self.shared.lock().state = SocketState::Closing;
        let _ = self.commands.send(Command::Close);
    }
}

fn fail(shared: &Mutex<Shared>, events: &mpsc::UnboundedSender<SocketEvent>, condition: ErrorCondition) {
    {
        let mut shared = shared.lock();
        shared.error = condition;
        shared.state = SocketState::Closed;
    }
    let _ = events.send(SocketEvent::Error);
}

fn classify_handshake_error(error: &WsError) -> ErrorCondition {
    match error {
        WsError::Io(_) => ErrorCondition::Connect,
        WsError::Tls(_) => ErrorCondition::Tls,
        WsError::Http(_) => ErrorCondition::Rejected,
        _ => ErrorCondition::Generic,
    }
}

fn is_handshake_header(name: &HeaderName) -> bool {
    name == HOST
        || name == CONNECTION
        || name == UPGRADE
        || name == SEC_WEBSOCKET_KEY
        || name == SEC_WEBSOCKET_VERSION
}

fn build_request(
    uri: &url::Url,
    headers: &HeaderMap,
) -> Result<http::Request<()>, WsError> {
    let mut request = uri.as_str().into_client_request()?;
    for (name, value) in headers {
        if is_handshake_header(name) {
            continue;
        }
        request.headers_mut().append(name.clone(), value.clone());
    }
    Ok(request)
}

fn tls_setup(secure: bool, ignore_tls_errors: bool) -> Option<tokio_tungstenite::Connector> {
    if !(secure && ignore_tls_errors) {
        return None;
    }
    native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .ok()
        .map(tokio_tungstenite::Connector::NativeTls)
}

fn encode_close(close: Option<CloseFrame<'_>>) -> Bytes {
    match close {
        Some(close) => {
            let mut buf = BytesMut::with_capacity(2 + close.reason.len());
            buf.extend_from_slice(&u16::from(close.code).to_be_bytes());
            buf.extend_from_slice(close.reason.as_bytes());
            buf.freeze()
        }
        None => Bytes::new(),
    }
}

fn decode_close(data: &[u8]) -> Option<CloseFrame<'static>> {
    if data.len() < 2 {
        return None;
    }
    let code = u16::from_be_bytes([data[0], data[1]]);
    let reason = String::from_utf8_lossy(&data[2..]).into_owned();
    Some(CloseFrame { code: CloseCode::from(code), reason: reason.into() })
}

fn message_to_frame(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::text(text)),
        Message::Binary(data) => Some(Frame::binary(data)),
        Message::Ping(data) => Some(Frame::new(FrameType::Ping, data, false)),
        Message::Pong(data) => Some(Frame::new(FrameType::Pong, data, false)),
        Message::Close(close) => Some(Frame::new(FrameType::Close, encode_close(close), false)),
        Message::Frame(_) => None,
    }
}

/// Buffers message fragments until the final one arrives, then yields one
/// complete message plus the number of frames it covers.
#[derive(Default)]
struct WriteBuffer {
    partial: Vec<Frame>,
}

impl WriteBuffer {
    fn push(&mut self, frame: Frame) -> Option<(Message, usize)> {
        if !frame.kind.is_content() {
            let message = match frame.kind {
                FrameType::Ping => Message::Ping(frame.data.to_vec()),
                FrameType::Pong => Message::Pong(frame.data.to_vec()),
                _ => Message::Close(decode_close(&frame.data)),
            };
            return Some((message, 1));
        }

        if frame.more {
            self.partial.push(frame);
            return None;
        }

        if self.partial.is_empty() {
            return Some((content_message(frame.kind, frame.data.to_vec()), 1));
        }

        let count = self.partial.len() + 1;
        let kind = self.partial[0].kind;
        let mut data = Vec::new();
        for fragment in self.partial.drain(..) {
            data.extend_from_slice(&fragment.data);
        }
        data.extend_from_slice(&frame.data);
        Some((content_message(kind, data), count))
    }
}

fn content_message(kind: FrameType, data: Vec<u8>) -> Message {
    match kind {
        FrameType::Text => Message::Text(String::from_utf8_lossy(&data).into_owned()),
        _ => Message::Binary(data),
    }
}

async fn run_connection(
    shared: Arc<Mutex<Shared>>,
    events: mpsc::UnboundedSender<SocketEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    connect_timeout: Duration,
) {
    let (uri, headers, connect_host, connect_port, ignore_policies, ignore_tls_errors) = {
        let shared = shared.lock();
        let Some((uri, headers)) = shared.request.clone() else {
            return;
        };
        (
            uri,
            headers,
            shared.connect_host.clone(),
            shared.connect_port,
            shared.ignore_policies,
            shared.ignore_tls_errors,
        )
    };

    let host = connect_host.unwrap_or_else(|| uri.host_str().unwrap_or_default().to_string());
    let port = connect_port.or_else(|| uri.port_or_known_default()).unwrap_or(80);

    debug!(
        "connecting to {}:{} (uri={}, ignore_policies={}, ignore_tls_errors={})",
        host, port, uri, ignore_policies, ignore_tls_errors
    );

    let stream = match timeout(connect_timeout, TcpStream::connect((host.as_str(), port))).await {
        Err(_) => return fail(&shared, &events, ErrorCondition::ConnectTimeout),
        Ok(Err(_)) => return fail(&shared, &events, ErrorCondition::Connect),
        Ok(Ok(stream)) => stream,
    };

    let request = match build_request(&uri, &headers) {
        Ok(request) => request,
        Err(_) => return fail(&shared, &events, ErrorCondition::Generic),
    };
    let connector = tls_setup(uri.scheme() == "wss", ignore_tls_errors);

    let handshake = timeout(
        connect_timeout,
        tokio_tungstenite::client_async_tls_with_config(request, stream, None, connector),
    )
    .await;

    let (ws, response) = match handshake {
        Err(_) => return fail(&shared, &events, ErrorCondition::ConnectTimeout),
        Ok(Err(error)) => {
            let condition = classify_handshake_error(&error);
            if let WsError::Http(response) = error {
                let code = response.status().as_u16();
                let reason = response
                    .status()
                    .canonical_reason()
                    .unwrap_or_default()
                    .to_string();
                let headers = response.headers().clone();
                let body = response.into_body().map(Bytes::from).unwrap_or_default();
                shared.lock().response = Some(ResponseMeta { code, reason, headers, body });
            }
            return fail(&shared, &events, condition);
        }
        Ok(Ok(pair)) => pair,
    };

    {
        let mut shared = shared.lock();
        shared.response = Some(ResponseMeta {
            code: response.status().as_u16(),
            reason: response
                .status()
                .canonical_reason()
                .unwrap_or_default()
                .to_string(),
            headers: response.headers().clone(),
            body: Bytes::new(),
        });
        shared.state = SocketState::Connected;
    }
    let _ = events.send(SocketEvent::Connected);

    let (mut sink, mut stream) = ws.split();
    let mut write_buffer = WriteBuffer::default();

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(message)) => {
                    let peer_closed = matches!(message, Message::Close(_));
                    if let Some(frame) = message_to_frame(message) {
                        shared.lock().incoming.push_back(frame);
                        let _ = events.send(SocketEvent::ReadyRead);
                    }
                    if peer_closed {
                        let _ = events.send(SocketEvent::PeerClosed);
                    }
                }
                Some(Err(_)) => {
                    return fail(&shared, &events, ErrorCondition::Generic);
                }
                None => {
                    shared.lock().state = SocketState::Closed;
                    let _ = events.send(SocketEvent::Closed);
                    return;
                }
            },
            command = commands.recv() => match command {
                Some(Command::Frame(frame)) => {
                    if let Some((message, count)) = write_buffer.push(frame) {
                        match sink.send(message).await {
                            Ok(()) => {
                                let _ = events.send(SocketEvent::FramesWritten(count));
                            }
                            Err(_) => {
                                return fail(&shared, &events, ErrorCondition::Generic);
                            }
                        }
                    }
                }
                Some(Command::Close) => {
                    // begin the close handshake; keep reading until the
                    // stream ends so the peer's close is observed
                    let _ = sink.send(Message::Close(None)).await;
                }
                None => {
                    // the socket handle is gone; nothing will read events
                    let _ = sink.close().await;
                    shared.lock().state = SocketState::Closed;
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_payload_round_trip() {
        let close = CloseFrame { code: CloseCode::from(1001), reason: "going away".into() };
        let encoded = encode_close(Some(close));
        let decoded = decode_close(&encoded).unwrap();
        assert_eq!(u16::from(decoded.code), 1001);
        assert_eq!(decoded.reason, "going away");

        assert!(encode_close(None).is_empty());
        assert!(decode_close(b"").is_none());
        assert!(decode_close(b"x").is_none());
    }

    #[test]
    fn write_buffer_passes_complete_frames_through() {
        let mut buffer = WriteBuffer::default();
        let (message, count) = buffer.push(Frame::text("hi")).unwrap();
        assert_eq!(count, 1);
        assert_eq!(message, Message::Text("hi".into()));
    }

    #[test]
    fn write_buffer_coalesces_fragments() {
        let mut buffer = WriteBuffer::default();
        assert!(buffer.push(Frame::new(FrameType::Text, "a", true)).is_none());
        assert!(buffer
            .push(Frame::new(FrameType::Continuation, "b", true))
            .is_none());
        let (message, count) = buffer
            .push(Frame::new(FrameType::Continuation, "c", false))
            .unwrap();
        assert_eq!(count, 3);
        assert_eq!(message, Message::Text("abc".into()));
    }

    #[test]
    fn write_buffer_maps_control_frames() {
        let mut buffer = WriteBuffer::default();
        let (message, count) = buffer
            .push(Frame::new(FrameType::Ping, "p", false))
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(message, Message::Ping(b"p".to_vec()));

        let (message, _) = buffer.push(Frame::close()).unwrap();
        assert_eq!(message, Message::Close(None));
    }

    #[test]
    fn incoming_messages_become_single_fragment_frames() {
        let frame = message_to_frame(Message::Text("x".into())).unwrap();
        assert_eq!(frame.kind, FrameType::Text);
        assert!(!frame.more);

        let frame = message_to_frame(Message::Close(Some(CloseFrame {
            code: CloseCode::from(1000),
            reason: "bye".into(),
        })))
        .unwrap();
        assert_eq!(frame.kind, FrameType::Close);
        assert_eq!(&frame.data[..2], &1000u16.to_be_bytes());
        assert_eq!(&frame.data[2..], b"bye");
    }

    #[test]
    fn handshake_headers_are_not_copied() {
        let uri = url::Url::parse("ws://origin.example/sock").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(HOST, http::HeaderValue::from_static("client.example"));
        headers.insert("x-app", http::HeaderValue::from_static("yes"));
        headers.insert(
            SEC_WEBSOCKET_VERSION,
            http::HeaderValue::from_static("13"),
        );

        let request = build_request(&uri, &headers).unwrap();
        assert_eq!(request.headers().get("x-app").unwrap(), "yes");
        // tungstenite derives these from the URI and its own handshake
        assert_eq!(request.headers().get(HOST).unwrap(), "origin.example");
    }
}
