//! Route lookup: mapping an incoming request to its origin targets.

use std::collections::HashMap;

use async_trait::async_trait;

/// What kind of connection a route lookup is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteKind {
    Http,
    WebSocket,
}

/// One candidate origin endpoint in the ordered failover list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Host to open the TCP connection to.
    pub connect_host: String,
    pub connect_port: u16,
    /// Use `wss` when connecting.
    pub ssl: bool,
    /// Skip origin policy checks on the outbound socket.
    pub trusted: bool,
    /// Accept invalid TLS certificates.
    pub insecure: bool,
    /// When non-empty, replaces the host of the request URI.
    pub host: String,
    /// When non-empty, the control session subscribes to this channel as
    /// soon as it is created.
    pub sub_channel: String,
}

impl Target {
    pub fn new(connect_host: impl Into<String>, connect_port: u16) -> Self {
        Self {
            connect_host: connect_host.into(),
            connect_port,
            ssl: false,
            trusted: false,
            insecure: false,
            host: String::new(),
            sub_channel: String::new(),
        }
    }
}

/// The result of a route lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    /// Signature issuer for upstream signing; empty means use the
    /// configured default.
    pub sig_iss: String,
    /// Signature key for upstream signing; empty means use the configured
    /// default.
    pub sig_key: String,
    /// Channel prefix handed to the control session.
    pub prefix: String,
    /// Candidate origins, tried in order.
    pub targets: Vec<Target>,
}

/// Resolves request coordinates to a routing [`Entry`]. `None` means the
/// request has no route and is rejected with a 502.
#[async_trait]
pub trait Router: Send + Sync {
    async fn entry(
        &self,
        kind: RouteKind,
        is_secure: bool,
        host: &str,
        path: &str,
    ) -> Option<Entry>;
}

/// A fixed, host-keyed [`Router`] with an optional fallback entry. Suitable
/// for tests and embeddings whose route table is known up front.
#[derive(Debug, Clone, Default)]
pub struct StaticRouter {
    routes: HashMap<String, Entry>,
    fallback: Option<Entry>,
}

impl StaticRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route for an exact host.
    pub fn route(mut self, host: impl Into<String>, entry: Entry) -> Self {
        self.routes.insert(host.into(), entry);
        self
    }

    /// Set the entry returned when no host matches.
    pub fn fallback(mut self, entry: Entry) -> Self {
        self.fallback = Some(entry);
        self
    }
}

#[async_trait]
impl Router for StaticRouter {
    async fn entry(
        &self,
        _kind: RouteKind,
        _is_secure: bool,
        host: &str,
        _path: &str,
    ) -> Option<Entry> {
        self.routes.get(host).or(self.fallback.as_ref()).cloned()
    }
}
