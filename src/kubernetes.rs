use crate::aggregator::Aggregator;
use crate::error::{Error, Result};
use crate::identity::{AuthMode, Identity, RequestContext};
use crate::permission::AccessReview;
use crate::session::{Query, SourceResolver};
use crate::source::{LineSink, StreamSource, Tail};
use crate::types::{Line, SourceId, TailFrom, Verb};
use crate::utils::selector_to_labels_string;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::io::AsyncBufReadExt;
use futures::StreamExt;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{ListParams, LogParams, PostParams};
use kube::config::{AuthInfo, KubeConfigOptions, Kubeconfig};
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{Config as WatcherConfig, Event, watcher};
use kube::{Api, Client, ResourceExt};
use std::fmt::Debug;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};


const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Consecutive watch errors after which a pod watcher gives up.
const WATCH_ATTEMPTS: usize = 5;

trait HasSelector {
    fn get_selector(&self) -> Option<&LabelSelector>;
}

impl HasSelector for k8s_openapi::api::apps::v1::Deployment {
    fn get_selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().map(|s| &s.selector)
    }
}

impl HasSelector for k8s_openapi::api::apps::v1::StatefulSet {
    fn get_selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().map(|s| &s.selector)
    }
}

impl HasSelector for k8s_openapi::api::apps::v1::DaemonSet {
    fn get_selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().map(|s| &s.selector)
    }
}

impl HasSelector for k8s_openapi::api::apps::v1::ReplicaSet {
    fn get_selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().map(|s| &s.selector)
    }
}

impl HasSelector for k8s_openapi::api::batch::v1::Job {
    fn get_selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().and_then(|s| s.selector.as_ref())
    }
}

async fn get_selector_from_resource_generic<T>(
    client: &Client,
    name: &str,
    namespace: &str,
) -> Result<Option<String>>
where
    T: k8s_openapi::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + k8s_openapi::Metadata<Ty = k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta>
        + HasSelector
        + serde::de::DeserializeOwned
        + serde::Serialize
        + Clone
        + Debug
        + Send
        + Sync,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let res = api.get(name).await?;
    let selector = res
        .get_selector()
        .and_then(selector_to_labels_string)
        .ok_or_else(|| Error::usage(format!("{} {}/{} has no label selector", T::KIND, namespace, name)))?;
    Ok(Some(selector))
}

/// Resolves a workload to the label selector of its pods. Plain pods have no
/// selector and resolve to `None`.
pub async fn get_selector_from_resource(
    client: &Client,
    resource_type: &str,
    name: &str,
    namespace: &str,
) -> Result<Option<String>> {
    match resource_type {
        "deployment" | "deploy" => {
            get_selector_from_resource_generic::<k8s_openapi::api::apps::v1::Deployment>(
                client, name, namespace,
            )
            .await
        }
        "statefulset" | "sts" => {
            get_selector_from_resource_generic::<k8s_openapi::api::apps::v1::StatefulSet>(
                client, name, namespace,
            )
            .await
        }
        "daemonset" | "ds" => {
            get_selector_from_resource_generic::<k8s_openapi::api::apps::v1::DaemonSet>(
                client, name, namespace,
            )
            .await
        }
        "job" => {
            get_selector_from_resource_generic::<k8s_openapi::api::batch::v1::Job>(
                client, name, namespace,
            )
            .await
        }
        "replicaset" | "rs" => {
            get_selector_from_resource_generic::<k8s_openapi::api::apps::v1::ReplicaSet>(
                client, name, namespace,
            )
            .await
        }
        "pod" | "po" => Ok(None),
        _ => Err(Error::usage(format!(
            "unsupported resource type: {}",
            resource_type
        ))),
    }
}

/// Clients for the cluster API: the service's own, plus one per caller token.
#[derive(Clone)]
pub struct ClusterClients {
    name: String,
    config: kube::Config,
    service: Client,
}

impl ClusterClients {
    /// Uses the named kubeconfig context, or whatever `kube` infers (current
    /// context, then in-cluster service account) when none is given.
    pub async fn new(context: Option<&str>) -> anyhow::Result<Self> {
        let (name, config) = match context {
            Some(ctx) => {
                let config = kube::Config::from_kubeconfig(&KubeConfigOptions {
                    context: Some(ctx.to_string()),
                    ..Default::default()
                })
                .await
                .map_err(|e| anyhow::anyhow!("Context '{}' not found in kubeconfig: {}", ctx, e))?;
                (ctx.to_string(), config)
            }
            None => {
                let name = Kubeconfig::read()
                    .ok()
                    .and_then(|k| k.current_context)
                    .unwrap_or_else(|| "in-cluster".to_string());
                (name, kube::Config::infer().await?)
            }
        };
        let service = Client::try_from(config.clone())?;
        info!("Initialized client for context: {}", name);
        Ok(Self {
            name,
            config,
            service,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bearer identities get a client that authenticates with exactly that
    /// token and none of the service's own credentials.
    pub fn client_for(&self, identity: &Identity) -> Result<Client> {
        match identity {
            Identity::Bearer(token) => {
                let mut config = self.config.clone();
                config.auth_info = AuthInfo {
                    token: Some(token.expose().to_string().into()),
                    ..Default::default()
                };
                Ok(Client::try_from(config)?)
            }
            Identity::ServiceAccount | Identity::Local => Ok(self.service.clone()),
        }
    }
}

/// Access reviews through `SelfSubjectAccessReview`, made as the identity
/// under review.
pub struct KubeAccessReview {
    clients: ClusterClients,
}

impl KubeAccessReview {
    pub fn new(clients: ClusterClients) -> Self {
        Self { clients }
    }
}

fn access_review(namespace: &str, verb: Verb) -> SelfSubjectAccessReview {
    SelfSubjectAccessReview {
        spec: SelfSubjectAccessReviewSpec {
            resource_attributes: Some(ResourceAttributes {
                namespace: Some(namespace.to_string()),
                verb: Some(verb.as_str().to_string()),
                resource: Some("pods".to_string()),
                subresource: Some("log".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[async_trait]
impl AccessReview for KubeAccessReview {
    async fn allowed(&self, identity: &Identity, namespace: &str, verb: Verb) -> Result<bool> {
        let api: Api<SelfSubjectAccessReview> = Api::all(self.clients.client_for(identity)?);
        let review = api
            .create(&PostParams::default(), &access_review(namespace, verb))
            .await?;
        let status = review.status.unwrap_or_default();
        if !status.allowed {
            debug!(
                %namespace,
                %verb,
                reason = status.reason.as_deref().unwrap_or(""),
                "access review denied"
            );
        }
        Ok(status.allowed)
    }
}

/// Splits the RFC 3339 prefix the log API adds when asked for timestamps.
pub fn split_timestamp(raw: &str) -> Line {
    if let Some((ts, message)) = raw.split_once(' ') {
        if let Ok(ts) = DateTime::parse_from_rfc3339(ts) {
            let mut line = Line::new(message);
            line.timestamp = Some(ts.with_timezone(&Utc));
            return line;
        }
    }
    Line::new(raw)
}

pub fn tail_lines(from: TailFrom) -> Option<i64> {
    match from {
        TailFrom::Beginning => None,
        TailFrom::End => Some(0),
        TailFrom::Last(n) => Some(n as i64),
    }
}

/// Log request for one container. Reconnects ask for everything since the
/// last delivered timestamp instead of the initial tail window.
pub fn log_params(
    container: &str,
    from: TailFrom,
    follow: bool,
    last: Option<DateTime<Utc>>,
) -> LogParams {
    LogParams {
        follow,
        container: Some(container.to_string()),
        timestamps: true,
        tail_lines: if last.is_none() { tail_lines(from) } else { None },
        since_seconds: last.map(|ts| (Utc::now() - ts).num_seconds().max(0) + 1),
        ..Default::default()
    }
}

/// Drops lines a reconnect replays. The log API resumes at whole seconds, so
/// a new connection repeats lines up to the last delivered timestamp; lines
/// sharing that timestamp are told apart by how many were already delivered.
#[derive(Debug, Default)]
pub struct ReplayFilter {
    last: Option<DateTime<Utc>>,
    at_last: usize,
    to_skip: usize,
}

impl ReplayFilter {
    pub fn last(&self) -> Option<DateTime<Utc>> {
        self.last
    }

    pub fn reconnected(&mut self) {
        self.to_skip = self.at_last;
    }

    /// Whether a line with this timestamp is new.
    pub fn admit(&mut self, ts: Option<DateTime<Utc>>) -> bool {
        let Some(ts) = ts else { return true };
        match self.last {
            Some(last) if ts < last => false,
            Some(last) if ts == last && self.to_skip > 0 => {
                self.to_skip -= 1;
                false
            }
            Some(last) if ts == last => {
                self.at_last += 1;
                true
            }
            _ => {
                self.last = Some(ts);
                self.at_last = 1;
                self.to_skip = 0;
                true
            }
        }
    }
}

/// Follows one container through the pods/log API. After the stream drops
/// it reconnects from the last delivered timestamp and drops the replayed
/// lines. A missing pod ends the tail.
pub struct KubeLogTail {
    api: Api<Pod>,
    pod: String,
    container: String,
    from: TailFrom,
    follow: bool,
    retry: Duration,
}

impl KubeLogTail {
    pub fn new(api: Api<Pod>, pod: &str, container: &str, from: TailFrom, follow: bool) -> Self {
        Self {
            api,
            pod: pod.to_string(),
            container: container.to_string(),
            from,
            follow,
            retry: RETRY_DELAY,
        }
    }
}

#[async_trait]
impl Tail for KubeLogTail {
    async fn follow(self: Box<Self>, sink: &mut LineSink, cancel: CancellationToken) -> Result<()> {
        let mut replay = ReplayFilter::default();
        loop {
            let params = log_params(&self.container, self.from, self.follow, replay.last());
            let opened = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                opened = self.api.log_stream(&self.pod, &params) => opened,
            };
            match opened {
                Ok(stream) => {
                    replay.reconnected();
                    let mut lines = stream.lines();
                    loop {
                        let next = tokio::select! {
                            _ = cancel.cancelled() => return Ok(()),
                            next = lines.next() => next,
                        };
                        match next {
                            Some(Ok(raw)) => {
                                let line = split_timestamp(&raw);
                                if !replay.admit(line.timestamp) {
                                    continue;
                                }
                                sink.send(line).await?;
                            }
                            Some(Err(err)) => {
                                warn!(pod = %self.pod, container = %self.container, %err, "error reading log stream");
                                break;
                            }
                            None => break,
                        }
                    }
                    if !self.follow {
                        return Ok(());
                    }
                    debug!(
                        pod = %self.pod,
                        container = %self.container,
                        "log stream ended, reconnecting in {:?}",
                        self.retry
                    );
                }
                Err(kube::Error::Api(err)) if err.code == 404 => {
                    info!(pod = %self.pod, container = %self.container, "pod not found, stopping tail");
                    return Ok(());
                }
                Err(err) if !self.follow => return Err(err.into()),
                Err(err) => {
                    warn!(
                        pod = %self.pod,
                        container = %self.container,
                        %err,
                        "failed to open log stream, retrying in {:?}",
                        self.retry
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.retry) => {}
            }
        }
    }
}

/// Identifies a namespace's pod watch in aggregate failures.
pub fn watch_id(cluster: &str, namespace: &str) -> SourceId {
    SourceId::new(
        cluster,
        namespace,
        "*",
        "*",
        &format!("/api/v1/namespaces/{}/pods?watch", namespace),
    )
}

/// Which pods of a namespace a query selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodFilter {
    All,
    Labels(String),
    Name(String),
}

impl PodFilter {
    fn watcher_config(&self) -> WatcherConfig {
        match self {
            PodFilter::All => WatcherConfig::default(),
            PodFilter::Labels(selector) => WatcherConfig::default().labels(selector),
            PodFilter::Name(name) => WatcherConfig::default().fields(&format!("metadata.name={}", name)),
        }
    }

    fn list_params(&self) -> ListParams {
        match self {
            PodFilter::All => ListParams::default(),
            PodFilter::Labels(selector) => ListParams::default().labels(selector),
            PodFilter::Name(name) => ListParams::default().fields(&format!("metadata.name={}", name)),
        }
    }
}

/// Running and pending pods are tailed while following; a one-shot read also
/// covers pods whose containers have already finished.
pub fn should_tail(pod: &Pod, follow: bool) -> bool {
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown");
    match phase {
        "Running" | "Pending" => true,
        "Succeeded" | "Failed" => !follow,
        _ => false,
    }
}

pub fn containers(pod: &Pod, query: &Query) -> Vec<String> {
    pod.spec
        .as_ref()
        .map(|spec| {
            spec.containers
                .iter()
                .map(|c| c.name.clone())
                .filter(|name| query.matches_container(name))
                .collect()
        })
        .unwrap_or_default()
}

/// Resolves queries against the cluster API with the caller's credentials.
pub struct KubeResolver {
    mode: AuthMode,
    clients: ClusterClients,
    cluster: String,
}

impl KubeResolver {
    pub fn new(mode: AuthMode, clients: ClusterClients, cluster: impl Into<String>) -> Self {
        Self {
            mode,
            clients,
            cluster: cluster.into(),
        }
    }

    async fn filters(&self, client: &Client, query: &Query, namespace: &str) -> Result<Vec<PodFilter>> {
        let mut filters = Vec::new();
        for target in &query.targets {
            match get_selector_from_resource(client, target.kind(), &target.name, namespace).await? {
                Some(selector) => filters.push(PodFilter::Labels(selector)),
                None => filters.push(PodFilter::Name(target.name.clone())),
            }
        }
        if let Some(selector) = &query.selector {
            filters.push(PodFilter::Labels(selector.clone()));
        }
        if filters.is_empty() {
            filters.push(PodFilter::All);
        }
        Ok(filters)
    }
}

#[async_trait]
impl SourceResolver for KubeResolver {
    async fn resolve(
        &self,
        ctx: &RequestContext,
        query: &Query,
        aggregator: &Aggregator,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let identity = self.mode.identity(ctx)?;
        let client = self.clients.client_for(&identity)?;

        for namespace in &query.namespaces {
            let tracker = PodTracker {
                api: Api::namespaced(client.clone(), namespace),
                cluster: self.cluster.clone(),
                namespace: namespace.clone(),
                query: query.clone(),
                aggregator: aggregator.clone(),
            };
            for filter in self.filters(&client, query, namespace).await? {
                if query.follow {
                    let tracker = tracker.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        debug!(cluster = %tracker.cluster, namespace = %tracker.namespace, ?filter, "starting pod watcher");
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            res = tracker.watch(&filter) => if let Err(err) = res {
                                warn!(cluster = %tracker.cluster, namespace = %tracker.namespace, ?filter, %err, "pod watcher stopped");
                                tracker.aggregator.fail(tracker.watch_id(), err);
                            },
                        }
                    });
                } else {
                    for pod in tracker.api.list(&filter.list_params()).await? {
                        tracker.apply(&pod).await?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
struct PodTracker {
    api: Api<Pod>,
    cluster: String,
    namespace: String,
    query: Query,
    aggregator: Aggregator,
}

impl PodTracker {
    fn watch_id(&self) -> SourceId {
        watch_id(&self.cluster, &self.namespace)
    }

    /// Retries watch errors with backoff; gives up after `WATCH_ATTEMPTS` in a
    /// row without a successful event.
    async fn watch(&self, filter: &PodFilter) -> Result<()> {
        let mut stream = watcher(self.api.clone(), filter.watcher_config())
            .default_backoff()
            .boxed();
        let mut errors = 0;
        while let Some(event) = stream.next().await {
            let event = match event {
                Ok(event) => {
                    errors = 0;
                    event
                }
                Err(err) => {
                    errors += 1;
                    if errors >= WATCH_ATTEMPTS {
                        return Err(Error::source_failed(self.watch_id(), err));
                    }
                    warn!(cluster = %self.cluster, namespace = %self.namespace, %err, errors, "pod watch error, retrying");
                    continue;
                }
            };
            match event {
                Event::Apply(pod) | Event::InitApply(pod) => self.apply(&pod).await?,
                Event::Delete(pod) => {
                    info!(cluster = %self.cluster, pod = %pod.name_any(), "pod deleted");
                    self.stop(&pod.name_any());
                }
                Event::Init => debug!(cluster = %self.cluster, namespace = %self.namespace, "initializing pod watcher"),
                Event::InitDone => debug!(cluster = %self.cluster, namespace = %self.namespace, "pod watcher initialized"),
            }
        }
        Ok(())
    }

    /// Joins every selected container of a live pod; finished pods leave.
    async fn apply(&self, pod: &Pod) -> Result<()> {
        let name = pod.name_any();
        if !should_tail(pod, self.query.follow) {
            self.stop(&name);
            return Ok(());
        }

        for container in containers(pod, &self.query) {
            let id = SourceId::new(
                &self.cluster,
                &self.namespace,
                &name,
                &container,
                &format!("/api/v1/namespaces/{}/pods/{}/log", self.namespace, name),
            );
            let tail = KubeLogTail::new(
                self.api.clone(),
                &name,
                &container,
                self.query.from,
                self.query.follow,
            );
            match self.aggregator.add(StreamSource::new(id, tail)).await {
                Ok(true) => info!(cluster = %self.cluster, pod = %name, %container, "tailing container"),
                Ok(false) => {}
                Err(Error::Closed) => return Err(Error::Closed),
                Err(err) => debug!(pod = %name, %container, %err, "container tail did not start"),
            }
        }
        Ok(())
    }

    fn stop(&self, pod: &str) {
        let key = format!("{}/{}", self.namespace, pod);
        for id in self.aggregator.sources().into_iter().filter(|id| id.pod == key) {
            self.aggregator.remove(&id);
        }
    }
}
