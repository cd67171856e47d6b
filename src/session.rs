//! One client's log streaming session: authorize, fan in, stream, close.

use crate::aggregator::{Aggregator, AggregatorConfig};
use crate::error::{Error, Result};
use crate::identity::RequestContext;
use crate::permission::PermissionGuard;
use crate::types::{LogRecord, ResourceSpec, SourceId, TailFrom, Verb};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;


/// What a client asked to tail.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub namespaces: Vec<String>,
    /// Empty means every pod matched by `selector`, or every pod.
    pub targets: Vec<ResourceSpec>,
    pub selector: Option<String>,
    pub container: Option<String>,
    pub from: TailFrom,
    pub follow: bool,
}

impl Query {
    /// Name-only matching for backends that know pod names but not labels.
    /// Workload targets match the pods their controllers name after them.
    pub fn matches_pod(&self, pod: &str) -> bool {
        if self.targets.is_empty() {
            return true;
        }
        self.targets.iter().any(|target| match target.kind() {
            "pod" => target.name == pod,
            _ => pod
                .strip_prefix(target.name.as_str())
                .is_some_and(|rest| rest.starts_with('-')),
        })
    }

    pub fn matches_container(&self, container: &str) -> bool {
        self.container.as_deref().is_none_or(|want| want == container)
    }
}

/// Turns a query into aggregate members.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// Adds the initial members. Resolvers that track membership changes keep
    /// adding and removing members from a background task until `cancel`
    /// fires.
    async fn resolve(
        &self,
        ctx: &RequestContext,
        query: &Query,
        aggregator: &Aggregator,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Authorizing,
    Streaming,
    Closed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub buffer: usize,
    pub all_or_nothing: bool,
    /// Empty allows every namespace.
    pub allowed_namespaces: Vec<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            buffer: 1000,
            all_or_nothing: false,
            allowed_namespaces: Vec::new(),
        }
    }
}

struct Shared {
    state: Mutex<SessionState>,
    error: Mutex<Option<Arc<Error>>>,
    aggregator: Mutex<Option<Aggregator>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

pub struct Session {
    id: Uuid,
    ctx: RequestContext,
    query: Query,
    guard: Arc<PermissionGuard>,
    resolver: Arc<dyn SourceResolver>,
    options: SessionOptions,
    cancel: CancellationToken,
    shared: Arc<Shared>,
}

impl Session {
    pub fn new(
        ctx: RequestContext,
        query: Query,
        guard: Arc<PermissionGuard>,
        resolver: Arc<dyn SourceResolver>,
        options: SessionOptions,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            ctx,
            query,
            guard,
            resolver,
            options,
            cancel: parent.child_token(),
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::Created),
                error: Mutex::new(None),
                aggregator: Mutex::new(None),
                monitor: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    /// The member failure that ended an all-or-nothing session.
    pub fn err(&self) -> Option<Arc<Error>> {
        self.shared.error.lock().clone()
    }

    /// Every failure the aggregate has seen, fatal or isolated.
    pub fn failures(&self) -> Vec<(SourceId, Arc<Error>)> {
        self.shared
            .aggregator
            .lock()
            .as_ref()
            .map(Aggregator::failures)
            .unwrap_or_default()
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn sources(&self) -> Vec<SourceId> {
        self.shared
            .aggregator
            .lock()
            .as_ref()
            .map(Aggregator::sources)
            .unwrap_or_default()
    }

    /// Authorizes every requested namespace and starts streaming. Nothing is
    /// started when authorization fails.
    pub async fn open(&self) -> Result<mpsc::Receiver<LogRecord>> {
        {
            let mut state = self.shared.state.lock();
            match *state {
                SessionState::Created => *state = SessionState::Authorizing,
                SessionState::Closed => return Err(Error::Closed),
                _ => return Err(Error::usage("session already opened")),
            }
        }
        debug!(session = %self.id, namespaces = ?self.query.namespaces, "authorizing session");

        if let Err(err) = self.authorize().await {
            warn!(session = %self.id, %err, "session rejected");
            self.transition(SessionState::Authorizing, SessionState::Failed);
            return Err(err);
        }

        let config = AggregatorConfig {
            buffer: self.options.buffer,
            end_on_exhaustion: !self.query.follow,
            all_or_nothing: self.options.all_or_nothing,
        };
        let (aggregator, rx) = Aggregator::new(&self.cancel, config);
        *self.shared.aggregator.lock() = Some(aggregator.clone());
        if !self.transition(SessionState::Authorizing, SessionState::Streaming) {
            aggregator.close().await;
            return Err(Error::Closed);
        }

        let hold = aggregator.hold();
        let resolved = self
            .resolver
            .resolve(&self.ctx, &self.query, &aggregator, &self.cancel)
            .await;
        drop(hold);
        if let Err(err) = resolved {
            // Under all-or-nothing a member failure closes the aggregate and
            // later adds only see `Closed`; report the member failure instead.
            let err = match aggregator.failures().into_iter().next() {
                Some((id, cause)) if self.options.all_or_nothing => {
                    *self.shared.error.lock() = Some(cause.clone());
                    Error::source_failed(&id, &cause)
                }
                _ => err,
            };
            warn!(session = %self.id, %err, "resolving sources failed");
            self.transition(SessionState::Streaming, SessionState::Failed);
            aggregator.close().await;
            return Err(err);
        }

        info!(session = %self.id, sources = aggregator.len(), "session streaming");
        let monitor = tokio::spawn(monitor(
            self.id,
            self.shared.clone(),
            aggregator,
            self.options.all_or_nothing,
        ));
        *self.shared.monitor.lock() = Some(monitor);
        Ok(rx)
    }

    /// Closes the aggregate and every source. Idempotent.
    pub async fn close(&self) {
        let aggregator = {
            let mut state = self.shared.state.lock();
            if matches!(*state, SessionState::Closed | SessionState::Failed) {
                return;
            }
            *state = SessionState::Closed;
            self.shared.aggregator.lock().clone()
        };
        debug!(session = %self.id, "closing session");
        self.cancel.cancel();
        if let Some(aggregator) = aggregator {
            aggregator.close().await;
        }
    }

    /// Waits until the aggregate has ended and the final state is recorded.
    /// Returns at once for a session that never started streaming.
    pub async fn finished(&self) {
        let monitor = self.shared.monitor.lock().take();
        if let Some(monitor) = monitor {
            let _ = monitor.await;
        }
    }

    async fn authorize(&self) -> Result<()> {
        let allowed = &self.options.allowed_namespaces;
        if !allowed.is_empty() {
            if let Some(ns) = self.query.namespaces.iter().find(|ns| !allowed.contains(ns)) {
                return Err(Error::usage(format!("namespace {} is not allowed", ns)));
            }
        }
        self.guard
            .check(&self.ctx, &self.query.namespaces, Verb::Get)
            .await
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let mut state = self.shared.state.lock();
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn monitor(id: Uuid, shared: Arc<Shared>, aggregator: Aggregator, all_or_nothing: bool) {
    aggregator.closed().await;

    let mut state = shared.state.lock();
    if *state != SessionState::Streaming {
        return;
    }
    match aggregator.err() {
        Some(err) if all_or_nothing => {
            warn!(session = %id, %err, "session failed");
            *state = SessionState::Failed;
            *shared.error.lock() = Some(err);
        }
        _ => {
            info!(session = %id, "session ended");
            *state = SessionState::Closed;
        }
    }
}
