//! The effective client request and the header-manipulation seam.
//!
//! Before a session opens its origin leg it hands the request to a
//! [`RequestRewriter`], which applies the proxy's header policy and decides
//! whether the client is trusted. [`DefaultRewriter`] implements the stock
//! policy: `Grip-Sig` trust detection and re-signing, `X-Forwarded-For`
//! rewriting, the `X-Forwarded-Protocol` marker, and renaming of headers
//! the origin must see under their original name.

use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use log::debug;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::{SessionConfig, XffRule};
use crate::route::Entry;

const GRIP_SIG: &str = "grip-sig";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTOCOL: &str = "x-forwarded-protocol";

/// The effective client request: URI plus header list, mutated in place by
/// the rewriter and then used to open the origin leg.
#[derive(Debug, Clone)]
pub struct RequestData {
    pub uri: Url,
    pub headers: HeaderMap,
}

/// Applies the proxy's request-header policy.
///
/// Returns `true` when the client is trusted, which enables pass-to-upstream
/// handling in the session.
pub trait RequestRewriter: Send + Sync {
    fn manipulate_request_headers(
        &self,
        request: &mut RequestData,
        entry: &Entry,
        sig_iss: &str,
        sig_key: &str,
        config: &SessionConfig,
        peer_address: Option<IpAddr>,
    ) -> bool;
}

#[derive(Debug, Serialize, Deserialize)]
struct SigClaims {
    iss: String,
    exp: u64,
}

fn sign_claims(iss: &str, key: &str) -> Option<String> {
    let exp = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs() + 3600;
    let claims = SigClaims { iss: iss.to_string(), exp };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(key.as_bytes()),
    )
    .ok()
}

fn verify_token(token: &[u8], key: &str) -> bool {
    let Ok(token) = std::str::from_utf8(token) else {
        return false;
    };
    decode::<SigClaims>(
        token,
        &DecodingKey::from_secret(key.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .is_ok()
}

fn apply_xff(headers: &mut HeaderMap, rule: &XffRule, peer_address: Option<IpAddr>) {
    if rule.truncate.is_none() && !rule.append {
        return;
    }

    let mut entries: Vec<String> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();

    if let Some(max) = rule.truncate {
        entries.truncate(max);
    }
    if rule.append {
        if let Some(addr) = peer_address {
            entries.push(addr.to_string());
        }
    }

    headers.remove(X_FORWARDED_FOR);
    if !entries.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&entries.join(", ")) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }
}

/// Rename each configured header with an `Orig-` prefix so the origin can
/// distinguish the client's value from anything the proxy sets.
fn mark_orig_headers(headers: &mut HeaderMap, names: &[String]) {
    for name in names {
        let Ok(source) = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes()) else {
            continue;
        };
        let Ok(renamed) = HeaderName::from_bytes(format!("orig-{}", name.to_ascii_lowercase()).as_bytes())
        else {
            continue;
        };

        let values: Vec<HeaderValue> = headers.get_all(&source).iter().cloned().collect();
        if values.is_empty() {
            continue;
        }
        headers.remove(&source);
        for value in values {
            headers.append(renamed.clone(), value);
        }
    }
}

/// The stock [`RequestRewriter`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRewriter;

impl RequestRewriter for DefaultRewriter {
    fn manipulate_request_headers(
        &self,
        request: &mut RequestData,
        _entry: &Entry,
        sig_iss: &str,
        sig_key: &str,
        config: &SessionConfig,
        peer_address: Option<IpAddr>,
    ) -> bool {
        let trusted = !config.default_upstream_key.is_empty()
            && request
                .headers
                .get(GRIP_SIG)
                .map(|v| verify_token(v.as_bytes(), &config.default_upstream_key))
                .unwrap_or(false);

        if trusted {
            debug!("request carries a valid upstream signature");
        } else {
            // an unverified signature must not survive into the origin request
            request.headers.remove(GRIP_SIG);

            if !sig_iss.is_empty() && !sig_key.is_empty() {
                if let Some(token) = sign_claims(sig_iss, sig_key) {
                    if let Ok(value) = HeaderValue::from_str(&token) {
                        request.headers.insert(GRIP_SIG, value);
                    }
                }
            }
        }

        let rule = if trusted { &config.xff_trusted_rule } else { &config.xff_rule };
        apply_xff(&mut request.headers, rule, peer_address);

        if config.use_x_forwarded_protocol {
            if let Ok(value) = HeaderValue::from_str(request.uri.scheme()) {
                request.headers.insert(X_FORWARDED_PROTOCOL, value);
            }
        }

        mark_orig_headers(&mut request.headers, &config.orig_headers_need_mark);

        trusted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: HeaderMap) -> RequestData {
        RequestData {
            uri: Url::parse("wss://example.com/sock").unwrap(),
            headers,
        }
    }

    fn rewrite(
        request: &mut RequestData,
        config: &SessionConfig,
        peer: Option<IpAddr>,
    ) -> bool {
        DefaultRewriter.manipulate_request_headers(
            request,
            &Entry::default(),
            &config.default_sig_iss,
            &config.default_sig_key,
            config,
            peer,
        )
    }

    #[test]
    fn untrusted_request_is_signed() {
        let config = SessionConfig {
            default_sig_iss: "relay".into(),
            default_sig_key: "signing-key".into(),
            ..SessionConfig::default()
        };
        let mut req = request(HeaderMap::new());

        let trusted = rewrite(&mut req, &config, None);

        assert!(!trusted);
        let token = req.headers.get(GRIP_SIG).expect("signature added");
        assert!(verify_token(token.as_bytes(), "signing-key"));
        assert!(!verify_token(token.as_bytes(), "other-key"));
    }

    #[test]
    fn valid_upstream_signature_is_trusted_and_kept() {
        let config = SessionConfig {
            default_upstream_key: "upstream-key".into(),
            ..SessionConfig::default()
        };
        let token = sign_claims("upstream", "upstream-key").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(GRIP_SIG, HeaderValue::from_str(&token).unwrap());
        let mut req = request(headers);

        let trusted = rewrite(&mut req, &config, None);

        assert!(trusted);
        assert_eq!(req.headers.get(GRIP_SIG).unwrap().to_str().unwrap(), token);
    }

    #[test]
    fn bogus_upstream_signature_is_stripped() {
        let config = SessionConfig {
            default_upstream_key: "upstream-key".into(),
            ..SessionConfig::default()
        };
        let mut headers = HeaderMap::new();
        headers.insert(GRIP_SIG, HeaderValue::from_static("not-a-jwt"));
        let mut req = request(headers);

        let trusted = rewrite(&mut req, &config, None);

        assert!(!trusted);
        assert!(req.headers.get(GRIP_SIG).is_none());
    }

    #[test]
    fn xff_append_and_truncate() {
        let config = SessionConfig {
            xff_rule: XffRule { truncate: Some(1), append: true },
            ..SessionConfig::default()
        };
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("10.0.0.1, 10.0.0.2"));
        let mut req = request(headers);

        rewrite(&mut req, &config, Some("192.168.1.5".parse().unwrap()));

        assert_eq!(
            req.headers.get(X_FORWARDED_FOR).unwrap().to_str().unwrap(),
            "10.0.0.1, 192.168.1.5"
        );
    }

    #[test]
    fn xff_untouched_without_a_rule() {
        let config = SessionConfig::default();
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("10.0.0.1"));
        let mut req = request(headers);

        rewrite(&mut req, &config, Some("192.168.1.5".parse().unwrap()));

        assert_eq!(
            req.headers.get(X_FORWARDED_FOR).unwrap().to_str().unwrap(),
            "10.0.0.1"
        );
    }

    #[test]
    fn forwarded_protocol_marker() {
        let config = SessionConfig {
            use_x_forwarded_protocol: true,
            ..SessionConfig::default()
        };
        let mut req = request(HeaderMap::new());

        rewrite(&mut req, &config, None);

        assert_eq!(
            req.headers.get(X_FORWARDED_PROTOCOL).unwrap().to_str().unwrap(),
            "wss"
        );
    }

    #[test]
    fn orig_headers_are_renamed() {
        let config = SessionConfig {
            orig_headers_need_mark: vec!["X-Custom".into()],
            ..SessionConfig::default()
        };
        let mut headers = HeaderMap::new();
        headers.append("x-custom", HeaderValue::from_static("one"));
        headers.append("x-custom", HeaderValue::from_static("two"));
        let mut req = request(headers);

        rewrite(&mut req, &config, None);

        assert!(req.headers.get("x-custom").is_none());
        let marked: Vec<_> = req
            .headers
            .get_all("orig-x-custom")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(marked, vec!["one", "two"]);
    }
}
