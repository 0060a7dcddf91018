//! The proxy session: one client WebSocket bridged to one origin WebSocket.
//!
//! A [`Session`] owns both legs of a proxied connection and, when the GRIP
//! extension is active, one control session on the pub/sub bus. It runs as
//! a single task: every transport signal and control event is delivered
//! serially through the session's event loop, so there is no locking and no
//! shared mutable state between sessions.
//!
//! Data moves through two pull-based pumps, one per direction. Each pump
//! reads as long as frames are available and the number of unacknowledged
//! frames on the downstream side stays below [`PENDING_FRAMES_MAX`]; flush
//! acknowledgements from one side re-run the pump of the other. The cap
//! turns a stalled peer into TCP-level backpressure on the opposite peer
//! instead of unbounded buffering.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderValue, SEC_WEBSOCKET_EXTENSIONS};
use http::HeaderMap;
use log::{debug, warn};

use crate::config::SessionConfig;
use crate::control::{ControlEvent, ControlHandle, ControlManager};
use crate::extension;
use crate::frame::{Frame, FrameType};
use crate::request::{RequestData, RequestRewriter};
use crate::route::{RouteKind, Router, Target};
use crate::socket::{Connector, ErrorCondition, SocketEvent, SocketHandle, SocketState};

/// Ceiling on frames written to a transport but not yet acknowledged as
/// flushed, per direction.
pub const PENDING_FRAMES_MAX: usize = 100;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a session in log output. Only part of the id is printed;
/// that is enough to tell nearby sessions apart.
#[derive(Debug, Clone, Copy)]
struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0 % 0x10000)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Connecting,
    Connected,
    Closing,
}

enum Step {
    Client(SocketEvent),
    Origin(SocketEvent),
    Control(ControlEvent),
}

async fn socket_event(handle: &mut Option<SocketHandle>) -> SocketEvent {
    match handle {
        Some(handle) => match handle.events.recv().await {
            Some(event) => event,
            // the transport dropped its event stream without a final
            // signal; treat it as a failure
            None => SocketEvent::Error,
        },
        None => std::future::pending().await,
    }
}

async fn control_event(handle: &mut Option<ControlHandle>) -> ControlEvent {
    match handle {
        Some(handle) => match handle.events.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

/// A single proxied WebSocket connection.
///
/// Create one per accepted client socket and drive it with
/// [`Session::run`], which resolves once both transports have been
/// released; that resolution is the session's terminal signal.
pub struct Session {
    id: SessionId,
    state: State,
    router: Arc<dyn Router>,
    connector: Arc<dyn Connector>,
    rewriter: Arc<dyn RequestRewriter>,
    control_manager: Option<Arc<dyn ControlManager>>,
    config: SessionConfig,

    client: Option<SocketHandle>,
    origin: Option<SocketHandle>,
    control: Option<ControlHandle>,

    request: Option<RequestData>,
    targets: VecDeque<Target>,
    channel_prefix: String,
    message_prefix: Vec<u8>,
    sub_channel: String,

    in_pending: usize,
    out_pending: usize,
    /// Frame type of the upstream message currently being relayed, if any.
    /// Continuation frames that arrive while this is `None` belong to a
    /// message whose head was consumed or dropped, and are dropped too.
    out_read_in_progress: Option<FrameType>,
    detached: bool,
    /// Recorded for trusted clients; reserved for forwarding client
    /// control frames verbatim. Nothing consults it yet.
    pass_to_upstream: bool,
}

impl Session {
    pub fn new(
        router: Arc<dyn Router>,
        connector: Arc<dyn Connector>,
        rewriter: Arc<dyn RequestRewriter>,
        control_manager: Option<Arc<dyn ControlManager>>,
        config: SessionConfig,
    ) -> Self {
        Self {
            id: SessionId::next(),
            state: State::Idle,
            router,
            connector,
            rewriter,
            control_manager,
            config,
            client: None,
            origin: None,
            control: None,
            request: None,
            targets: VecDeque::new(),
            channel_prefix: String::new(),
            message_prefix: b"m:".to_vec(),
            sub_channel: String::new(),
            in_pending: 0,
            out_pending: 0,
            out_read_in_progress: None,
            detached: false,
            pass_to_upstream: false,
        }
    }

    /// Whether the handshake deemed the client trusted. Recorded for a
    /// future policy that would forward client control frames verbatim;
    /// nothing consults it yet.
    pub fn pass_to_upstream(&self) -> bool {
        self.pass_to_upstream
    }

    /// Drive the session over an accepted client socket until both
    /// transports are released.
    pub async fn run(mut self, client: SocketHandle) {
        self.handshake(client).await;

        loop {
            if self.client.is_none() && self.origin.is_none() {
                break;
            }

            let step = tokio::select! {
                event = socket_event(&mut self.client) => Step::Client(event),
                event = socket_event(&mut self.origin) => Step::Origin(event),
                event = control_event(&mut self.control) => Step::Control(event),
            };

            match step {
                Step::Client(event) => self.on_client_event(event),
                Step::Origin(event) => self.on_origin_event(event),
                Step::Control(event) => self.on_control_event(event),
            }
        }

        debug!("session {}: finished by passthrough", self.id);
    }

    async fn handshake(&mut self, client: SocketHandle) {
        self.state = State::Connecting;

        let uri = client.socket.request_uri();
        let headers = client.socket.request_headers();
        let peer_address = client.socket.peer_address();
        self.client = Some(client);

        let host = uri.host_str().unwrap_or("").to_string();
        let is_secure = uri.scheme() == "wss";
        let path = uri.path().to_string();
        let mut request = RequestData { uri, headers };

        let entry = self
            .router
            .entry(RouteKind::WebSocket, is_secure, &host, &path)
            .await;
        let Some(entry) = entry else {
            warn!("session {}: {} has 0 routes", self.id, host);
            self.reject(502, "Bad Gateway", &format!("No route for host: {}", host));
            return;
        };

        let (sig_iss, sig_key) = if !entry.sig_iss.is_empty() && !entry.sig_key.is_empty() {
            (entry.sig_iss.clone(), entry.sig_key.clone())
        } else {
            (
                self.config.default_sig_iss.clone(),
                self.config.default_sig_key.clone(),
            )
        };

        self.channel_prefix = entry.prefix.clone();
        self.targets = entry.targets.iter().cloned().collect();

        debug!("session {}: {} has {} routes", self.id, host, self.targets.len());

        let trusted = self.rewriter.manipulate_request_headers(
            &mut request,
            &entry,
            &sig_iss,
            &sig_key,
            &self.config,
            peer_address,
        );

        // don't proxy extensions, as we may not know how to handle them;
        // grip is the only extension offered upstream
        request.headers.remove(SEC_WEBSOCKET_EXTENSIONS);
        request
            .headers
            .append(SEC_WEBSOCKET_EXTENSIONS, HeaderValue::from_static("grip"));

        if trusted {
            self.pass_to_upstream = true;
        }

        self.request = Some(request);
        self.try_next_target();
    }

    fn try_next_target(&mut self) {
        let Some(target) = self.targets.pop_front() else {
            self.reject(502, "Bad Gateway", "Error while proxying to origin.");
            return;
        };
        let Some(request) = self.request.as_ref() else {
            return;
        };

        let mut uri = request.uri.clone();
        let scheme = if target.ssl { "wss" } else { "ws" };
        let _ = uri.set_scheme(scheme);
        if !target.host.is_empty() && uri.set_host(Some(&target.host)).is_err() {
            warn!(
                "session {}: target host [{}] is not usable in a URI",
                self.id, target.host
            );
        }

        self.sub_channel = target.sub_channel.clone();

        debug!(
            "session {}: forwarding to {}:{}",
            self.id, target.connect_host, target.connect_port
        );

        let mut handle = self.connector.create_socket();
        if target.trusted {
            handle.socket.set_ignore_policies(true);
        }
        if target.insecure {
            handle.socket.set_ignore_tls_errors(true);
        }
        handle.socket.set_connect_host(&target.connect_host);
        handle.socket.set_connect_port(target.connect_port);
        handle.socket.start(uri, request.headers.clone());

        self.origin = Some(handle);
    }

    fn reject(&mut self, code: u16, reason: &str, message: &str) {
        self.reject_response(
            code,
            reason,
            HeaderMap::new(),
            Bytes::from(format!("{}\n", message)),
        );
    }

    fn reject_response(&mut self, code: u16, reason: &str, headers: HeaderMap, body: Bytes) {
        debug_assert_eq!(self.state, State::Connecting);

        self.state = State::Closing;
        if let Some(client) = self.client.as_mut() {
            client.socket.respond_error(code, reason, headers, body);
        }
    }

    /// Client → origin pump.
    fn try_read_in(&mut self) {
        loop {
            if self.out_pending >= PENDING_FRAMES_MAX {
                return;
            }
            let Some(client) = self.client.as_mut() else { return };
            if client.socket.frames_available() == 0 {
                return;
            }
            let Some(frame) = client.socket.read_frame() else { return };

            if self.detached {
                continue;
            }

            let Some(origin) = self.origin.as_mut() else { return };
            origin.socket.write_frame(frame);
            self.out_pending += 1;
        }
    }

    /// Origin → client pump, with GRIP routing when a control session is
    /// attached.
    fn try_read_out(&mut self) {
        loop {
            if self.in_pending >= PENDING_FRAMES_MAX {
                return;
            }
            let Some(origin) = self.origin.as_mut() else { return };
            if origin.socket.frames_available() == 0 {
                return;
            }
            let Some(frame) = origin.socket.read_frame() else { return };

            if self.detached {
                continue;
            }

            if frame.kind.is_content() {
                // we are skipping the rest of this message
                if frame.kind == FrameType::Continuation && self.out_read_in_progress.is_none() {
                    continue;
                }

                if frame.kind != FrameType::Continuation {
                    self.out_read_in_progress = Some(frame.kind);
                }

                let more = frame.more;

                if self.control.is_some() {
                    if frame.kind == FrameType::Text && frame.data.starts_with(b"c:") {
                        if !frame.more {
                            let payload = frame.data.slice(2..);
                            if let Some(control) = self.control.as_mut() {
                                control.session.send_grip_message(payload);
                            }
                        } else {
                            // grip messages must only be one frame; drop the
                            // head and suppress the continuations
                            self.out_read_in_progress = None;
                        }
                    } else if frame.kind != FrameType::Continuation
                        && frame.data.starts_with(self.message_prefix.as_slice())
                    {
                        self.relay_to_client(frame);
                    } else if frame.kind == FrameType::Continuation {
                        self.relay_to_client(frame);
                    } else {
                        // a head frame with neither prefix drops the whole
                        // message, continuations included
                        self.out_read_in_progress = None;
                    }
                } else {
                    self.relay_to_client(frame);
                }

                if !more {
                    self.out_read_in_progress = None;
                }
            } else {
                // always relay non-content frames
                self.relay_to_client(frame);
            }
        }
    }

    fn relay_to_client(&mut self, frame: Frame) {
        if let Some(client) = self.client.as_mut() {
            client.socket.write_frame(frame);
            self.in_pending += 1;
        }
    }

    fn on_client_event(&mut self, event: SocketEvent) {
        match event {
            // the client socket is handed over already connected
            SocketEvent::Connected => {}
            SocketEvent::ReadyRead => {
                let origin_ready = self
                    .origin
                    .as_ref()
                    .map(|o| o.socket.state() == SocketState::Connected)
                    .unwrap_or(false);
                if !self.detached && origin_ready {
                    self.try_read_in();
                }
            }
            SocketEvent::FramesWritten(count) => {
                self.in_pending = self.in_pending.saturating_sub(count);
                if !self.detached {
                    self.try_read_out();
                }
            }
            SocketEvent::PeerClosed => {
                if !self.detached {
                    if let Some(origin) = self.origin.as_mut() {
                        if origin.socket.state() != SocketState::Closing {
                            origin.socket.close();
                        }
                    }
                }
            }
            SocketEvent::Closed => {
                self.client = None;

                if !self.detached {
                    if let Some(origin) = self.origin.as_mut() {
                        if origin.socket.state() != SocketState::Closing {
                            origin.socket.close();
                        }
                    }
                }
            }
            SocketEvent::Error => {
                self.client = None;

                if !self.detached {
                    self.origin = None;
                }
            }
        }
    }

    fn on_origin_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Connected => self.on_origin_connected(),
            SocketEvent::ReadyRead => self.try_read_out(),
            SocketEvent::FramesWritten(count) => {
                self.out_pending = self.out_pending.saturating_sub(count);
                if !self.detached {
                    self.try_read_in();
                }
            }
            SocketEvent::PeerClosed => {
                if !self.detached {
                    if let Some(client) = self.client.as_mut() {
                        if client.socket.state() != SocketState::Closing {
                            client.socket.close();
                        }
                    }
                }
            }
            SocketEvent::Closed => {
                self.origin = None;

                if !self.detached {
                    if let Some(client) = self.client.as_mut() {
                        if client.socket.state() != SocketState::Closing {
                            client.socket.close();
                        }
                    }
                }
            }
            SocketEvent::Error => self.on_origin_error(),
        }
    }

    fn on_origin_connected(&mut self) {
        debug!("session {}: connected", self.id);

        self.state = State::Connected;

        let (reason, mut headers) = match self.origin.as_ref() {
            Some(origin) => (
                origin.socket.response_reason(),
                origin.socket.response_headers(),
            ),
            None => return,
        };

        // don't proxy extensions, as we may not know how to handle them
        let offered: Vec<Vec<u8>> = headers
            .get_all(SEC_WEBSOCKET_EXTENSIONS)
            .iter()
            .map(|v| v.as_bytes().to_vec())
            .collect();
        headers.remove(SEC_WEBSOCKET_EXTENSIONS);

        let grip = extension::find_extension(&offered, b"grip");
        if grip.is_some() || !self.sub_channel.is_empty() {
            if let Some(grip) = &grip {
                self.message_prefix = grip
                    .param(b"message-prefix")
                    .map(|p| p.to_vec())
                    .unwrap_or_else(|| b"m:".to_vec());
            }

            debug!(
                "session {}: grip enabled, message-prefix=[{}]",
                self.id,
                String::from_utf8_lossy(&self.message_prefix)
            );

            if let Some(manager) = &self.control_manager {
                let mut control = manager.create_session(&self.channel_prefix);
                control.session.start();

                if !self.sub_channel.is_empty() {
                    debug!(
                        "session {}: forcing subscription to [{}]",
                        self.id, self.sub_channel
                    );

                    let message = serde_json::json!({
                        "type": "subscribe",
                        "channel": self.sub_channel,
                    });
                    if let Ok(encoded) = serde_json::to_vec(&message) {
                        control.session.send_grip_message(Bytes::from(encoded));
                    }
                }

                self.control = Some(control);
            }
        }

        if let Some(client) = self.client.as_mut() {
            client.socket.respond_success(&reason, headers);
        }

        // send any frames the client queued during the handshake
        self.try_read_in();
    }

    fn on_origin_error(&mut self) {
        let condition = self
            .origin
            .as_ref()
            .map(|o| o.socket.error_condition())
            .unwrap_or(ErrorCondition::Generic);

        debug!(
            "session {}: target error state={:?}, condition={:?}",
            self.id, self.state, condition
        );

        if self.detached {
            self.origin = None;
            return;
        }

        if self.state == State::Connecting {
            match condition {
                ErrorCondition::Connect | ErrorCondition::ConnectTimeout | ErrorCondition::Tls => {
                    self.origin = None;
                    self.try_next_target();
                }
                ErrorCondition::Rejected => {
                    let response = self.origin.as_ref().map(|o| {
                        (
                            o.socket.response_code(),
                            o.socket.response_reason(),
                            o.socket.response_headers(),
                            o.socket.response_body(),
                        )
                    });
                    self.origin = None;
                    if let Some((code, reason, headers, body)) = response {
                        self.reject_response(code, &reason, headers, body);
                    }
                }
                _ => {
                    self.origin = None;
                    self.reject(502, "Bad Gateway", "Error while proxying to origin.");
                }
            }
        } else {
            self.client = None;
            self.origin = None;
        }
    }

    fn on_control_event(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Send { content_type, message } => {
                if let Some(client) = self.client.as_mut() {
                    if client.socket.state() != SocketState::Closing {
                        let kind = if content_type == "binary" {
                            FrameType::Binary
                        } else {
                            FrameType::Text
                        };
                        client.socket.write_frame(Frame::new(kind, message, false));
                        self.in_pending += 1;
                    }
                }
            }
            ControlEvent::Detach => {
                // a second detach is a no-op
                if self.detached {
                    return;
                }

                self.detached = true;
                debug!("session {}: detached", self.id);

                if let Some(origin) = self.origin.as_mut() {
                    if origin.socket.state() != SocketState::Closing {
                        origin.socket.close();
                    }
                }
            }
        }
    }
}
