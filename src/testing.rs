//! Scripted tail backends shared by unit tests.

use crate::aggregator::Aggregator;
use crate::error::{Error, Result};
use crate::identity::{AuthMode, Identity, RequestContext};
use crate::permission::{AccessReview, PermissionGuard};
use crate::session::{Query, SourceResolver};
use crate::source::{LineSink, StreamSource, Tail};
use crate::types::{Line, SourceId, Verb};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub enum Outcome {
    Exhaust,
    Fail(&'static str),
    Hang,
}

pub struct ScriptedTail {
    pub lines: Vec<String>,
    pub outcome: Outcome,
    pub open_error: Option<&'static str>,
    pub lossy: bool,
}

impl ScriptedTail {
    pub fn new(lines: &[&str], outcome: Outcome) -> Self {
        Self {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            outcome,
            open_error: None,
            lossy: false,
        }
    }
}

#[async_trait]
impl Tail for ScriptedTail {
    async fn open(&mut self) -> Result<()> {
        match self.open_error {
            Some(msg) => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                msg,
            ))),
            None => Ok(()),
        }
    }

    async fn follow(self: Box<Self>, sink: &mut LineSink, cancel: CancellationToken) -> Result<()> {
        for line in self.lines {
            sink.send(Line::new(line)).await?;
        }
        match self.outcome {
            Outcome::Exhaust => Ok(()),
            Outcome::Fail(msg) => Err(Error::source_failed("scripted", msg)),
            Outcome::Hang => {
                cancel.cancelled().await;
                Ok(())
            }
        }
    }

    fn lossy(&self) -> bool {
        self.lossy
    }
}

/// Emits whatever the test pushes until the sender is dropped.
pub struct ChannelTail {
    pub rx: mpsc::Receiver<String>,
}

#[async_trait]
impl Tail for ChannelTail {
    async fn follow(mut self: Box<Self>, sink: &mut LineSink, cancel: CancellationToken) -> Result<()> {
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                line = self.rx.recv() => line,
            };
            match line {
                Some(line) => sink.send(Line::new(line)).await?,
                None => return Ok(()),
            }
        }
    }
}

pub fn source_id(pod: &str) -> SourceId {
    SourceId::new("node-a", "default", pod, "app", &format!("/var/log/{pod}.log"))
}

pub fn scripted(pod: &str, lines: &[&str], outcome: Outcome) -> StreamSource {
    StreamSource::new(source_id(pod), ScriptedTail::new(lines, outcome))
}

/// Denies the listed namespaces and counts every review.
#[derive(Default)]
pub struct DenyList {
    pub denied: Vec<&'static str>,
    pub calls: AtomicUsize,
}

impl DenyList {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AccessReview for DenyList {
    async fn allowed(&self, _identity: &Identity, namespace: &str, _verb: Verb) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(!self.denied.contains(&namespace))
    }
}

pub fn guard(mode: AuthMode, denied: &[&'static str]) -> (Arc<PermissionGuard>, Arc<DenyList>) {
    let reviews = Arc::new(DenyList {
        denied: denied.to_vec(),
        calls: AtomicUsize::new(0),
    });
    (Arc::new(PermissionGuard::new(mode, reviews.clone())), reviews)
}

/// Hands out a fixed set of sources on the first resolve.
#[derive(Default)]
pub struct StaticResolver {
    sources: Mutex<Vec<StreamSource>>,
    calls: AtomicUsize,
}

impl StaticResolver {
    pub fn new(sources: Vec<StreamSource>) -> Arc<Self> {
        Arc::new(Self {
            sources: Mutex::new(sources),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceResolver for StaticResolver {
    async fn resolve(
        &self,
        _ctx: &RequestContext,
        _query: &Query,
        aggregator: &Aggregator,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let sources = std::mem::take(&mut *self.sources.lock());
        for source in sources {
            match aggregator.add(source).await {
                Ok(_) => {}
                Err(Error::Closed) => return Err(Error::Closed),
                // Recorded by the aggregator.
                Err(_) => {}
            }
        }
        Ok(())
    }
}
