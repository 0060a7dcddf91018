//! Session-level configuration.
//!
//! [`SessionConfig`] carries the knobs the proxy engine sets once and every
//! session consults during its handshake: default signing material, the
//! upstream trust key, and the header-rewriting rules. Values are plain
//! serde types so they layer through figment: built-in defaults, then a
//! `WsRelay.toml` file, then `WSRELAY_*` environment variables.

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// How to rewrite `X-Forwarded-For` for a class of clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct XffRule {
    /// Keep at most this many existing entries before appending.
    pub truncate: Option<usize>,
    /// Append the peer address.
    pub append: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Signature issuer used when a route entry does not carry its own.
    pub default_sig_iss: String,
    /// Signature key used when a route entry does not carry its own.
    pub default_sig_key: String,
    /// Key used to recognize requests already signed by a trusted upstream.
    pub default_upstream_key: String,
    /// Record the original request scheme in `X-Forwarded-Protocol`.
    pub use_x_forwarded_protocol: bool,
    /// `X-Forwarded-For` rule for untrusted clients.
    pub xff_rule: XffRule,
    /// `X-Forwarded-For` rule for trusted clients.
    pub xff_trusted_rule: XffRule,
    /// Headers to rename with an `Orig-` prefix before proxying.
    pub orig_headers_need_mark: Vec<String>,
}

impl SessionConfig {
    /// The default configuration sources: crate defaults, then the TOML
    /// file named by `WSRELAY_CONFIG` (default `WsRelay.toml`), then
    /// `WSRELAY_*` environment variables.
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(SessionConfig::default()))
            .merge(Toml::file(Env::var_or("WSRELAY_CONFIG", "WsRelay.toml")))
            .merge(Env::prefixed("WSRELAY_"))
    }

    /// Extract a configuration from a figment.
    pub fn from_figment(figment: &Figment) -> Result<Self, Error> {
        Ok(figment.extract()?)
    }
}
