//! The two halves of opening a streaming connection: the HTTP upgrade
//! request, then the first message the client sends on the new connection.

use crate::csrf::{CsrfProtection, validate_csrf_token};
use crate::error::Result;
use crate::identity::{AuthMode, RequestContext};
use std::sync::Arc;
use tracing::debug;


pub struct UpgradeGate {
    mode: AuthMode,
    token_cookie: String,
    csrf: Arc<dyn CsrfProtection>,
}

impl UpgradeGate {
    pub fn new(mode: AuthMode, token_cookie: impl Into<String>, csrf: Arc<dyn CsrfProtection>) -> Self {
        Self {
            mode,
            token_cookie: token_cookie.into(),
            csrf,
        }
    }

    /// Captures cookies and the caller's token from the upgrade request. In
    /// token mode a request without a token is turned away here.
    pub fn accept<B>(&self, request: &http::Request<B>) -> Result<RequestContext> {
        let ctx = RequestContext::from_headers(request.headers(), &self.token_cookie)?;
        self.mode.identity(&ctx)?;
        debug!(uri = %request.uri(), cookies = ctx.cookies().len(), "upgrade accepted");
        Ok(ctx)
    }

    /// Checks the CSRF token sent as the connection's first message.
    pub fn connection_init(&self, ctx: &RequestContext, csrf_token: &str) -> Result<()> {
        validate_csrf_token(ctx, self.csrf.as_ref(), csrf_token)
    }
}
