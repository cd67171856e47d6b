//! CSRF checks for the streaming upgrade.
//!
//! Per-request middleware can't run once a connection has been upgraded, so
//! the token the client sends afterwards is replayed through the regular
//! protection on a synthetic request carrying the session's cookies.

use crate::error::{Error, Result};
use crate::identity::{RequestContext, parse_cookies};
use http::Method;
use http::header::COOKIE;


pub const CSRF_HEADER: &str = "x-csrf-token";

const KEY_CONTEXT: &str = "tailhub csrf token v1";

pub trait CsrfProtection: Send + Sync {
    /// `Err` carries the rejection reason.
    fn protect(&self, request: &http::Request<()>) -> Result<(), String>;
}

/// Tokens are a keyed hash of the session cookie, so a token is only valid
/// alongside the session it was issued for.
pub struct SignedCsrf {
    key: [u8; 32],
    session_cookie: String,
}

impl SignedCsrf {
    pub fn new(secret: &str, session_cookie: impl Into<String>) -> Self {
        Self {
            key: blake3::derive_key(KEY_CONTEXT, secret.as_bytes()),
            session_cookie: session_cookie.into(),
        }
    }

    pub fn issue(&self, session_id: &str) -> String {
        self.expected(session_id).to_hex().to_string()
    }

    fn expected(&self, session_id: &str) -> blake3::Hash {
        blake3::keyed_hash(&self.key, session_id.as_bytes())
    }
}

impl CsrfProtection for SignedCsrf {
    fn protect(&self, request: &http::Request<()>) -> Result<(), String> {
        if matches!(
            *request.method(),
            Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
        ) {
            return Ok(());
        }

        let session = request
            .headers()
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(parse_cookies)
            .find(|(name, _)| *name == self.session_cookie)
            .map(|(_, value)| value)
            .ok_or_else(|| "missing session cookie".to_string())?;

        let presented = request
            .headers()
            .get(CSRF_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| "missing csrf token".to_string())?;
        let presented = blake3::Hash::from_hex(presented.trim())
            .map_err(|_| "malformed csrf token".to_string())?;

        // blake3::Hash compares in constant time.
        if presented == self.expected(&session) {
            Ok(())
        } else {
            Err("csrf token mismatch".to_string())
        }
    }
}

pub fn validate_csrf_token(
    ctx: &RequestContext,
    protection: &dyn CsrfProtection,
    token: &str,
) -> Result<()> {
    if ctx.cookies().is_empty() {
        return Err(Error::usage("no session cookies in request context"));
    }

    let cookie_header = ctx
        .cookies()
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join("; ");
    let request = http::Request::builder()
        .method(Method::POST)
        .uri("/")
        .header(COOKIE, cookie_header)
        .header(CSRF_HEADER, token)
        .body(())
        .map_err(|e| Error::Csrf(e.to_string()))?;

    protection.protect(&request).map_err(Error::Csrf)
}
