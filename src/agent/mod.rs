//! Node agent: serves the container log files of one node over the internal
//! RPC layer, and the client side that turns those files into sources.

pub mod files;


use crate::aggregator::Aggregator;
use crate::debounce::Debouncer;
use crate::error::{Error, Result};
use crate::identity::{self, AuthMode, RequestContext};
use crate::permission::PermissionGuard;
use crate::session::{Query, SourceResolver};
use crate::source::{LineSink, StreamSource, Tail};
use crate::types::{Line, SourceId, TailFrom, Verb};
use async_trait::async_trait;
use files::{FileStat, FileTail, LogFile};
use futures::{Stream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

pub type LineStream = Pin<Box<dyn Stream<Item = Result<Line, Status>> + Send>>;
pub type FileEventStream = Pin<Box<dyn Stream<Item = Result<FileEvent, Status>> + Send>>;

#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    pub node: String,
    pub file: LogFile,
    pub stat: FileStat,
}

impl FileInfo {
    pub fn source_id(&self) -> SourceId {
        SourceId::new(
            &self.node,
            &self.file.namespace,
            &self.file.pod,
            &self.file.container,
            &self.file.path.display().to_string(),
        )
    }

    fn file_name(&self) -> String {
        self.file
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FileEvent {
    Added(FileInfo),
    Modified(FileInfo),
    Deleted(FileInfo),
}

impl FileEvent {
    pub fn info(&self) -> &FileInfo {
        match self {
            FileEvent::Added(info) | FileEvent::Modified(info) | FileEvent::Deleted(info) => info,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListFilesRequest {
    pub namespaces: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct WatchFilesRequest {
    pub namespaces: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TailRequest {
    /// File name inside the agent's log directory.
    pub file: String,
    pub from: TailFrom,
    pub follow: bool,
}

/// The agent's RPC surface. Callers identify themselves through request
/// metadata (see [`identity::propagate`]).
#[async_trait]
pub trait NodeAgent: Send + Sync + 'static {
    async fn list_files(
        &self,
        request: Request<ListFilesRequest>,
    ) -> Result<Response<Vec<FileInfo>>, Status>;

    async fn tail(&self, request: Request<TailRequest>) -> Result<Response<LineStream>, Status>;

    async fn watch_files(
        &self,
        request: Request<WatchFilesRequest>,
    ) -> Result<Response<FileEventStream>, Status>;
}

/// Serves files from a directory on this node.
pub struct LocalAgent {
    node: String,
    log_dir: PathBuf,
    guard: Arc<PermissionGuard>,
    poll: Duration,
    debounce: Duration,
    shutdown: CancellationToken,
}

impl LocalAgent {
    pub fn new(
        node: impl Into<String>,
        log_dir: impl Into<PathBuf>,
        guard: Arc<PermissionGuard>,
        shutdown: &CancellationToken,
    ) -> Self {
        Self {
            node: node.into(),
            log_dir: log_dir.into(),
            guard,
            poll: Duration::from_millis(250),
            debounce: Duration::from_millis(100),
            shutdown: shutdown.child_token(),
        }
    }

    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_debounce(mut self, window: Duration) -> Self {
        self.debounce = window;
        self
    }

    async fn scan(&self, namespaces: &[String]) -> Result<Vec<FileInfo>> {
        Ok(files::scan(&self.log_dir, namespaces)
            .await?
            .into_iter()
            .map(|(file, stat)| FileInfo {
                node: self.node.clone(),
                file,
                stat,
            })
            .collect())
    }

    /// Only bare file names inside the log directory can be tailed.
    fn resolve_file(&self, name: &str) -> Result<LogFile, Status> {
        if Path::new(name).file_name().and_then(|n| n.to_str()) != Some(name) {
            return Err(Status::invalid_argument(format!("invalid log file name {name:?}")));
        }
        LogFile::parse(&self.log_dir.join(name))
            .ok_or_else(|| Status::invalid_argument(format!("not a container log file: {name}")))
    }
}

#[async_trait]
impl NodeAgent for LocalAgent {
    async fn list_files(
        &self,
        request: Request<ListFilesRequest>,
    ) -> Result<Response<Vec<FileInfo>>, Status> {
        let ctx = identity::from_metadata(request.metadata())?;
        let request = request.into_inner();
        self.guard.check(&ctx, &request.namespaces, Verb::List).await?;

        let files = self.scan(&request.namespaces).await?;
        debug!(node = %self.node, files = files.len(), "listed log files");
        Ok(Response::new(files))
    }

    async fn tail(&self, request: Request<TailRequest>) -> Result<Response<LineStream>, Status> {
        let ctx = identity::from_metadata(request.metadata())?;
        let request = request.into_inner();
        let file = self.resolve_file(&request.file)?;
        self.guard
            .check(&ctx, std::slice::from_ref(&file.namespace), Verb::Get)
            .await?;

        let id = SourceId::new(
            &self.node,
            &file.namespace,
            &file.pod,
            &file.container,
            &file.path.display().to_string(),
        );
        let mut tail = FileTail::new(&file.path, request.from);
        if request.follow {
            tail = tail.following(self.poll);
        }
        let mut source = StreamSource::new(id, tail);
        source.start(&self.shutdown).await?;
        let mut records = source.records();
        info!(node = %self.node, source = %source.id(), "serving tail");

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            loop {
                let record = tokio::select! {
                    _ = tx.closed() => {
                        source.close();
                        return;
                    }
                    record = records.recv() => record,
                };
                let Some(record) = record else { break };
                let line = Line {
                    timestamp: record.timestamp,
                    message: record.message,
                    metadata: record.metadata,
                };
                if tx.send(Ok(line)).await.is_err() {
                    source.close();
                    return;
                }
            }
            if let Some(err) = source.err() {
                let _ = tx.send(Err(Status::unavailable(err.to_string()))).await;
            }
        });
        Ok(Response::new(Box::pin(ReceiverStream::new(rx)) as LineStream))
    }

    async fn watch_files(
        &self,
        request: Request<WatchFilesRequest>,
    ) -> Result<Response<FileEventStream>, Status> {
        let ctx = identity::from_metadata(request.metadata())?;
        let request = request.into_inner();
        self.guard.check(&ctx, &request.namespaces, Verb::Watch).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = self.shutdown.child_token();
        let debouncer = {
            let tx = tx.clone();
            Debouncer::new(cancel.clone(), self.debounce, move |event: FileEvent| {
                let _ = tx.send(Ok(event));
            })
        };

        let watch = FileWatch {
            node: self.node.clone(),
            log_dir: self.log_dir.clone(),
            namespaces: request.namespaces,
            poll: self.poll,
        };
        tokio::spawn(async move {
            watch.run(tx, debouncer, &cancel).await;
            cancel.cancel();
        });
        Ok(Response::new(
            Box::pin(UnboundedReceiverStream::new(rx)) as FileEventStream
        ))
    }
}

struct FileWatch {
    node: String,
    log_dir: PathBuf,
    namespaces: Vec<String>,
    poll: Duration,
}

impl FileWatch {
    /// Polls the directory and diffs it against the previous scan. Additions
    /// and deletions go out immediately; modifications are debounced per file.
    async fn run(
        self,
        tx: mpsc::UnboundedSender<Result<FileEvent, Status>>,
        debouncer: Debouncer<PathBuf, FileEvent>,
        cancel: &CancellationToken,
    ) {
        let mut known: HashMap<PathBuf, FileInfo> = HashMap::new();
        loop {
            let scanned = match files::scan(&self.log_dir, &self.namespaces).await {
                Ok(scanned) => scanned,
                Err(err) => {
                    warn!(dir = %self.log_dir.display(), %err, "log directory scan failed");
                    let _ = tx.send(Err(err.into()));
                    return;
                }
            };

            let mut seen = HashSet::with_capacity(scanned.len());
            for (file, stat) in scanned {
                let path = file.path.clone();
                let info = FileInfo {
                    node: self.node.clone(),
                    file,
                    stat,
                };
                seen.insert(path.clone());
                match known.get(&path) {
                    None => {
                        let _ = tx.send(Ok(FileEvent::Added(info.clone())));
                    }
                    Some(previous) if previous.stat != info.stat => {
                        debouncer.debounce(path.clone(), FileEvent::Modified(info.clone()));
                    }
                    Some(_) => {}
                }
                known.insert(path, info);
            }
            known.retain(|path, info| {
                let keep = seen.contains(path);
                if !keep {
                    let _ = tx.send(Ok(FileEvent::Deleted(info.clone())));
                }
                keep
            });

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tx.closed() => return,
                _ = tokio::time::sleep(self.poll) => {}
            }
        }
    }
}

/// Calls an agent on behalf of a caller. Identity propagation fails closed:
/// in token mode a context without a token never reaches the agent.
#[derive(Clone)]
pub struct AgentClient {
    node: String,
    mode: AuthMode,
    agent: Arc<dyn NodeAgent>,
}

impl AgentClient {
    pub fn new(node: impl Into<String>, mode: AuthMode, agent: Arc<dyn NodeAgent>) -> Self {
        Self {
            node: node.into(),
            mode,
            agent,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    fn request<T>(&self, ctx: &RequestContext, message: T) -> Result<Request<T>> {
        let mut request = Request::new(message);
        identity::propagate(self.mode, ctx, &mut request)?;
        Ok(request)
    }

    pub async fn list_files(
        &self,
        ctx: &RequestContext,
        namespaces: &[String],
    ) -> Result<Vec<FileInfo>> {
        let request = self.request(
            ctx,
            ListFilesRequest {
                namespaces: namespaces.to_vec(),
            },
        )?;
        Ok(self.agent.list_files(request).await?.into_inner())
    }

    pub async fn tail(&self, ctx: &RequestContext, request: TailRequest) -> Result<LineStream> {
        let request = self.request(ctx, request)?;
        Ok(self.agent.tail(request).await?.into_inner())
    }

    pub async fn watch_files(
        &self,
        ctx: &RequestContext,
        namespaces: &[String],
    ) -> Result<FileEventStream> {
        let request = self.request(
            ctx,
            WatchFilesRequest {
                namespaces: namespaces.to_vec(),
            },
        )?;
        Ok(self.agent.watch_files(request).await?.into_inner())
    }
}

/// A [`Tail`] backed by an agent's line stream.
pub struct AgentTail {
    client: AgentClient,
    ctx: RequestContext,
    request: Option<TailRequest>,
    stream: Option<LineStream>,
}

impl AgentTail {
    pub fn new(client: AgentClient, ctx: RequestContext, request: TailRequest) -> Self {
        Self {
            client,
            ctx,
            request: Some(request),
            stream: None,
        }
    }
}

#[async_trait]
impl Tail for AgentTail {
    async fn open(&mut self) -> Result<()> {
        let request = self
            .request
            .take()
            .ok_or_else(|| Error::usage("agent tail opened twice"))?;
        self.stream = Some(self.client.tail(&self.ctx, request).await?);
        Ok(())
    }

    async fn follow(mut self: Box<Self>, sink: &mut LineSink, cancel: CancellationToken) -> Result<()> {
        let mut stream = self
            .stream
            .take()
            .ok_or_else(|| Error::usage("agent tail followed before open"))?;
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                item = stream.next() => item,
            };
            match item {
                Some(Ok(line)) => sink.send(line).await?,
                Some(Err(status)) => return Err(Error::Rpc(status)),
                None => return Ok(()),
            }
        }
    }
}

/// Resolves a query against the files of every registered agent.
pub struct AgentResolver {
    agents: Vec<AgentClient>,
}

impl AgentResolver {
    pub fn new(agents: Vec<AgentClient>) -> Self {
        Self { agents }
    }
}

fn tail_request(info: &FileInfo, from: TailFrom, follow: bool) -> TailRequest {
    TailRequest {
        file: info.file_name(),
        from,
        follow,
    }
}

fn matches(query: &Query, info: &FileInfo) -> bool {
    query.matches_pod(&info.file.pod) && query.matches_container(&info.file.container)
}

async fn add_file(
    aggregator: &Aggregator,
    client: &AgentClient,
    ctx: &RequestContext,
    info: &FileInfo,
    request: TailRequest,
) -> Result<()> {
    let tail = AgentTail::new(client.clone(), ctx.clone(), request);
    match aggregator.add(StreamSource::new(info.source_id(), tail)).await {
        Ok(_) => Ok(()),
        Err(Error::Closed) => Err(Error::Closed),
        Err(err) => {
            debug!(source = %info.source_id(), %err, "source did not start");
            Ok(())
        }
    }
}

#[async_trait]
impl SourceResolver for AgentResolver {
    async fn resolve(
        &self,
        ctx: &RequestContext,
        query: &Query,
        aggregator: &Aggregator,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if query.selector.is_some() {
            return Err(Error::usage("label selectors need cluster access"));
        }

        for client in &self.agents {
            // Subscribe before listing so files created in between are not missed.
            let events = if query.follow {
                Some(client.watch_files(ctx, &query.namespaces).await?)
            } else {
                None
            };

            for info in client.list_files(ctx, &query.namespaces).await? {
                if matches(query, &info) {
                    let request = tail_request(&info, query.from, query.follow);
                    add_file(aggregator, client, ctx, &info, request).await?;
                }
            }

            if let Some(events) = events {
                tokio::spawn(follow_files(
                    client.clone(),
                    ctx.clone(),
                    query.clone(),
                    aggregator.clone(),
                    events,
                    cancel.clone(),
                ));
            }
        }
        Ok(())
    }
}

async fn follow_files(
    client: AgentClient,
    ctx: RequestContext,
    query: Query,
    aggregator: Aggregator,
    mut events: FileEventStream,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.next() => event,
        };
        match event {
            Some(Ok(FileEvent::Added(info))) if matches(&query, &info) => {
                // New containers are read from their first line.
                let request = tail_request(&info, TailFrom::Beginning, true);
                if add_file(&aggregator, &client, &ctx, &info, request).await.is_err() {
                    return;
                }
            }
            Some(Ok(FileEvent::Deleted(info))) => {
                aggregator.remove(&info.source_id());
            }
            Some(Ok(_)) => {}
            Some(Err(status)) => {
                warn!(node = %client.node(), %status, "file watch failed");
                return;
            }
            None => return,
        }
    }
}
