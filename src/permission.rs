use crate::error::{Error, Result};
use crate::identity::{AuthMode, Identity, RequestContext};
use crate::types::Verb;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;


/// Answers "may this identity perform `verb` on pods/log in `namespace`".
#[async_trait]
pub trait AccessReview: Send + Sync {
    async fn allowed(&self, identity: &Identity, namespace: &str, verb: Verb) -> Result<bool>;
}

/// Reviewer for deployments without a cluster API: every review is denied.
pub struct DenyAll;

#[async_trait]
impl AccessReview for DenyAll {
    async fn allowed(&self, _identity: &Identity, _namespace: &str, _verb: Verb) -> Result<bool> {
        Ok(false)
    }
}

pub struct PermissionGuard {
    mode: AuthMode,
    reviewer: Arc<dyn AccessReview>,
}

impl PermissionGuard {
    pub fn new(mode: AuthMode, reviewer: Arc<dyn AccessReview>) -> Self {
        Self { mode, reviewer }
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    /// Every namespace must pass. Namespaces are reviewed in order and the
    /// first denial ends the check.
    pub async fn check(&self, ctx: &RequestContext, namespaces: &[String], verb: Verb) -> Result<()> {
        let identity = self.mode.identity(ctx)?;
        if namespaces.is_empty() {
            return Err(Error::usage("at least one namespace is required"));
        }
        if identity == Identity::Local {
            return Ok(());
        }

        for namespace in namespaces {
            if !self.reviewer.allowed(&identity, namespace, verb).await? {
                debug!(%namespace, %verb, "access review denied");
                return Err(Error::Forbidden {
                    verb: verb.to_string(),
                    namespace: namespace.clone(),
                });
            }
        }
        Ok(())
    }
}
