//! Caller identity and how it crosses hops: inbound HTTP request →
//! [`RequestContext`] → RPC metadata → Kubernetes API credentials.

use crate::error::{Error, Result};
use http::HeaderMap;
use http::header::{AUTHORIZATION, COOKIE};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use tonic::metadata::{MetadataMap, MetadataValue};


const RPC_AUTHORIZATION: &str = "authorization";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Every call carries the caller's bearer token, forwarded verbatim.
    Token,
    /// The service's own credentials are used.
    Cluster,
    /// No authorization checks; development only.
    #[default]
    Local,
}

/// An opaque caller credential. Never printed: `Debug` is redacted and
/// there is deliberately no `Display` or `Serialize`.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(token: &str) -> Option<Self> {
        let token = token.trim();
        if token.is_empty() {
            None
        } else {
            Some(Self(token.to_string()))
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken([REDACTED])")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Identity {
    Bearer(BearerToken),
    ServiceAccount,
    Local,
}

/// Request-scoped values threaded explicitly down the call chain.
#[derive(Clone, Default)]
pub struct RequestContext {
    cookies: Vec<(String, String)>,
    token: OnceLock<BearerToken>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cookies(cookies: Vec<(String, String)>) -> Self {
        Self {
            cookies,
            token: OnceLock::new(),
        }
    }

    /// Builds a context from inbound HTTP headers. The token comes from the
    /// `token_cookie` cookie unless an `Authorization: Bearer` header is
    /// present, which takes precedence.
    pub fn from_headers(headers: &HeaderMap, token_cookie: &str) -> Result<Self> {
        let cookies: Vec<(String, String)> = headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(parse_cookies)
            .collect();
        let ctx = Self::with_cookies(cookies);

        let from_header = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_bearer);
        let token = from_header.or_else(|| ctx.cookie(token_cookie).and_then(BearerToken::new));
        if let Some(token) = token {
            ctx.attach_token(token)?;
        }
        Ok(ctx)
    }

    pub fn cookies(&self) -> &[(String, String)] {
        &self.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// A context holds at most one token. Re-attaching the same value is a
    /// no-op; a different value is rejected.
    pub fn attach_token(&self, token: BearerToken) -> Result<()> {
        let current = self.token.get_or_init(|| token.clone());
        if *current == token {
            Ok(())
        } else {
            Err(Error::usage("request context already carries a different token"))
        }
    }

    pub fn token(&self) -> Option<&BearerToken> {
        self.token.get()
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.cookies.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("RequestContext")
            .field("cookies", &names)
            .field("token", &self.token.get())
            .finish()
    }
}

impl AuthMode {
    /// Resolves who the caller is under this mode. Token mode with no token
    /// attached fails closed.
    pub fn identity(&self, ctx: &RequestContext) -> Result<Identity> {
        match self {
            AuthMode::Token => ctx
                .token()
                .cloned()
                .map(Identity::Bearer)
                .ok_or_else(|| Error::Unauthenticated("no bearer token in request".to_string())),
            AuthMode::Cluster => Ok(Identity::ServiceAccount),
            AuthMode::Local => Ok(Identity::Local),
        }
    }
}

/// Copies the caller's token into outbound RPC metadata. In token mode a
/// missing token rejects the call before it leaves the process.
pub fn propagate<T>(
    mode: AuthMode,
    ctx: &RequestContext,
    request: &mut tonic::Request<T>,
) -> Result<(), tonic::Status> {
    if mode != AuthMode::Token {
        return Ok(());
    }
    let token = ctx
        .token()
        .ok_or_else(|| tonic::Status::unauthenticated("no bearer token in request context"))?;
    let value = MetadataValue::try_from(format!("Bearer {}", token.expose()))
        .map_err(|_| tonic::Status::unauthenticated("malformed bearer token"))?;
    request.metadata_mut().insert(RPC_AUTHORIZATION, value);
    Ok(())
}

/// Server side of [`propagate`]: rebuilds the request context from metadata.
pub fn from_metadata(metadata: &MetadataMap) -> Result<RequestContext, tonic::Status> {
    let ctx = RequestContext::new();
    let Some(value) = metadata.get(RPC_AUTHORIZATION) else {
        return Ok(ctx);
    };
    let token = value
        .to_str()
        .ok()
        .and_then(parse_bearer)
        .ok_or_else(|| tonic::Status::unauthenticated("malformed authorization metadata"))?;
    ctx.attach_token(token)?;
    Ok(ctx)
}

pub fn parse_cookies(header: &str) -> Vec<(String, String)> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            let value = value.trim().trim_matches('"');
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

fn parse_bearer(value: &str) -> Option<BearerToken> {
    let (scheme, token) = value.trim().split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        BearerToken::new(token)
    } else {
        None
    }
}
