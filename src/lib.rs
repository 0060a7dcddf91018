//! # wsrelay: a GRIP-capable WebSocket reverse-proxy session engine
//!
//! wsrelay bridges one accepted client WebSocket to one origin WebSocket,
//! frame by frame and in both directions, while enforcing a fixed
//! pending-frames budget so that a slow peer on either side translates into
//! TCP backpressure on the other instead of unbounded buffering.
//!
//! Beyond plain forwarding, the engine implements:
//!
//! - **Target failover**: the route entry carries an ordered list of origin
//!   targets; transient connection failures (refused, timed out, TLS) move
//!   on to the next target, and only an exhausted list turns into a client
//!   visible `502`.
//! - **The GRIP extension**: when the origin answers with the `grip`
//!   extension (or the target forces a subscription channel), upstream text
//!   frames prefixed `c:` are diverted to a pub/sub control session instead
//!   of the client, frames prefixed with the message prefix (default `m:`)
//!   go to the client, and anything else is dropped. Fragmented messages
//!   keep a single routing decision for all of their fragments.
//! - **Detach**: the control bus can take over the client connection; the
//!   origin leg is closed and the client is fed from control publishes
//!   only.
//!
//! ## Structure
//!
//! A [`Session`] is one proxied connection, run as a single task. Its
//! collaborators are traits: [`Router`] resolves request coordinates to a
//! route [`Entry`], a [`Connector`] produces origin [`Socket`]s, a
//! [`RequestRewriter`] applies the proxy's header policy, and an optional
//! [`ControlManager`] opens sessions on the pub/sub bus. Transport signals
//! arrive over per-socket event channels and are multiplexed serially by
//! the session's event loop, so sessions need no locks and cannot observe
//! each other.
//!
//! The crate ships two transports: [`transport::WsConnector`] (origin side,
//! backed by tokio-tungstenite) and the in-memory [`local`] module used for
//! testing and for embedding the engine behind an existing HTTP server.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use wsrelay::{
//!     DefaultRewriter, Entry, Session, SessionConfig, StaticRouter, Target,
//! };
//!
//! # async fn accept_client() -> wsrelay::SocketHandle { unimplemented!() }
//! # async fn example() {
//! let router = StaticRouter::new().route("app.example", Entry {
//!     targets: vec![Target::new("10.0.0.5", 8080)],
//!     ..Entry::default()
//! });
//!
//! let session = Session::new(
//!     Arc::new(router),
//!     Arc::new(wsrelay::transport::WsConnector::new()),
//!     Arc::new(DefaultRewriter),
//!     None,
//!     SessionConfig::default(),
//! );
//!
//! // `client` is the already-accepted client socket
//! let client = accept_client().await;
//! tokio::spawn(session.run(client));
//! # }
//! ```

pub mod config;
pub mod control;
pub mod extension;
pub mod frame;
pub mod local;
pub mod request;
pub mod route;
pub mod session;
pub mod socket;
pub mod transport;

mod error;

pub use async_trait::async_trait;

pub use config::{SessionConfig, XffRule};
pub use control::{ControlEvent, ControlEvents, ControlHandle, ControlManager, ControlSession};
pub use error::Error;
pub use frame::{Frame, FrameType};
pub use request::{DefaultRewriter, RequestData, RequestRewriter};
pub use route::{Entry, RouteKind, Router, StaticRouter, Target};
pub use session::{Session, PENDING_FRAMES_MAX};
pub use socket::{
    Connector, ErrorCondition, Socket, SocketEvent, SocketEvents, SocketHandle, SocketState,
};
