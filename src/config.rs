use crate::csrf::SignedCsrf;
use crate::identity::AuthMode;
use crate::session::SessionOptions;
use crate::upgrade::UpgradeGate;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;


/// Secret used to sign CSRF tokens. Redacted in `Debug`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CsrfSecret(String);

impl CsrfSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CsrfSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CsrfSecret([REDACTED])")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub auth_mode: AuthMode,
    /// Namespaces clients may ask for. Empty allows all.
    pub allowed_namespaces: Vec<String>,
    pub debounce_ms: u64,
    pub buffer_size: usize,
    pub session_cookie: String,
    pub token_cookie: String,
    pub csrf_secret: Option<CsrfSecret>,
    pub log_dir: PathBuf,
    pub node_name: Option<String>,
    pub poll_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auth_mode: AuthMode::Local,
            allowed_namespaces: Vec::new(),
            debounce_ms: 100,
            buffer_size: 1000,
            session_cookie: "tailhub_session".to_string(),
            token_cookie: "tailhub_token".to_string(),
            csrf_secret: None,
            log_dir: PathBuf::from("/var/log/containers"),
            node_name: None,
            poll_ms: 250,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(raw)?;
        if config.buffer_size == 0 {
            anyhow::bail!("buffer_size must be at least 1");
        }
        Ok(config)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(1))
    }

    /// This node's name: the configured one, then `NODE_NAME` as set by the
    /// downward API, then `local`.
    pub fn node_name(&self) -> String {
        self.node_name
            .clone()
            .or_else(|| std::env::var("NODE_NAME").ok().filter(|n| !n.is_empty()))
            .unwrap_or_else(|| "local".to_string())
    }

    /// Gate for streaming upgrades: tokens come from `token_cookie`, CSRF
    /// tokens are bound to `session_cookie` and signed with `csrf_secret`.
    pub fn upgrade_gate(&self) -> anyhow::Result<UpgradeGate> {
        let secret = self
            .csrf_secret
            .as_ref()
            .context("csrf_secret must be set to accept streaming upgrades")?;
        let csrf = SignedCsrf::new(secret.expose(), self.session_cookie.as_str());
        Ok(UpgradeGate::new(
            self.auth_mode,
            self.token_cookie.as_str(),
            Arc::new(csrf),
        ))
    }

    pub fn session_options(&self, all_or_nothing: bool) -> SessionOptions {
        SessionOptions {
            buffer: self.buffer_size,
            all_or_nothing,
            allowed_namespaces: self.allowed_namespaces.clone(),
        }
    }
}
