//! Fan-in of a changing set of stream sources into one bounded channel.
//!
//! Records from one source keep their emission order. Across sources the
//! output is in arrival order only: sources live on nodes with independent
//! clocks and no attempt is made at a global ordering.

use crate::error::{Error, Result};
use crate::source::{SourceHandle, StreamSource};
use crate::types::{LogRecord, SourceId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[cfg(test)]
mod tests;

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Capacity of the output channel.
    pub buffer: usize,
    /// Close once the last member leaves.
    pub end_on_exhaustion: bool,
    /// The first member failure closes the whole aggregate.
    pub all_or_nothing: bool,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            buffer: 1000,
            end_on_exhaustion: false,
            all_or_nothing: false,
        }
    }
}

#[derive(Clone)]
pub struct Aggregator {
    inner: Arc<Inner>,
}

struct Inner {
    config: AggregatorConfig,
    cancel: CancellationToken,
    done: CancellationToken,
    tasks: TaskTracker,
    state: Mutex<State>,
}

struct State {
    out: Option<mpsc::Sender<LogRecord>>,
    members: HashMap<SourceId, SourceHandle>,
    error: Option<Arc<Error>>,
    failures: Vec<(SourceId, Arc<Error>)>,
    holds: usize,
    closing: bool,
}

/// Keeps an aggregate that ends on exhaustion open while members are still
/// being added. Released on drop.
pub struct Hold {
    inner: Arc<Inner>,
}

impl Drop for Hold {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.holds -= 1;
        self.inner.end_if_drained(&state);
    }
}

impl Aggregator {
    /// The aggregate shuts down when `parent` is cancelled, when [`close`]
    /// is called, or when its policy says so.
    ///
    /// [`close`]: Aggregator::close
    pub fn new(
        parent: &CancellationToken,
        config: AggregatorConfig,
    ) -> (Self, mpsc::Receiver<LogRecord>) {
        let (tx, rx) = mpsc::channel(config.buffer.max(1));
        let inner = Arc::new(Inner {
            config,
            cancel: parent.child_token(),
            done: CancellationToken::new(),
            tasks: TaskTracker::new(),
            state: Mutex::new(State {
                out: Some(tx),
                members: HashMap::new(),
                error: None,
                failures: Vec::new(),
                holds: 0,
                closing: false,
            }),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let cancel = inner.cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            if let Some(inner) = weak.upgrade() {
                inner.shutdown().await;
            }
        });

        (Self { inner }, rx)
    }

    /// Starts `source` and joins it to the fan-in. Returns `Ok(false)` when a
    /// source with the same identity is already a member.
    pub async fn add(&self, mut source: StreamSource) -> Result<bool> {
        let id = source.id().clone();
        let handle = source.handle();
        {
            let mut state = self.inner.state.lock();
            if state.closing || self.inner.cancel.is_cancelled() {
                return Err(Error::Closed);
            }
            if state.members.contains_key(&id) {
                debug!(source = %id, "source already aggregated");
                return Ok(false);
            }
            state.members.insert(id.clone(), handle.clone());
        }

        if let Err(err) = source.start(&self.inner.cancel).await {
            let failure = source
                .err()
                .unwrap_or_else(|| Arc::new(Error::source_failed(&id, &err)));
            self.inner.member_left(&handle, Some(failure));
            return Err(err);
        }

        let rx = source.records();
        let lossy = source.lossy();
        {
            // Spawned under the lock so a concurrent shutdown either sees the
            // forwarder in its wait or has already taken the sender.
            let state = self.inner.state.lock();
            let out = if state.closing { None } else { state.out.clone() };
            let Some(out) = out else {
                drop(state);
                source.close();
                return Err(Error::Closed);
            };
            self.inner
                .tasks
                .spawn(forward(self.inner.clone(), handle, rx, out, lossy));
        }
        debug!(source = %id, lossy, "source joined aggregate");
        Ok(true)
    }

    pub fn hold(&self) -> Hold {
        self.inner.state.lock().holds += 1;
        Hold {
            inner: self.inner.clone(),
        }
    }

    /// Closes one member. The aggregate keeps running unless it ends on
    /// exhaustion and this was the last member.
    pub fn remove(&self, id: &SourceId) -> bool {
        let handle = self.inner.state.lock().members.remove(id);
        match handle {
            Some(handle) => {
                debug!(source = %id, "removing source");
                handle.close();
                true
            }
            None => false,
        }
    }

    /// Records a failure of something feeding the aggregate that is not a
    /// member itself, such as a discovery watch that gave up.
    pub fn fail(&self, id: SourceId, err: Error) {
        warn!(source = %id, %err, "aggregate input failed");
        let mut state = self.inner.state.lock();
        self.inner.record_failure(&mut state, &id, Arc::new(err));
    }

    /// Closes every member, waits for the forwarders and then closes the
    /// output channel. Safe to call any number of times.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.shutdown().await;
    }

    /// Resolves once the aggregate has fully shut down.
    pub async fn closed(&self) {
        self.inner.done.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    /// First fatal member error, if any.
    pub fn err(&self) -> Option<Arc<Error>> {
        self.inner.state.lock().error.clone()
    }

    /// Every member failure observed so far, in order.
    pub fn failures(&self) -> Vec<(SourceId, Arc<Error>)> {
        self.inner.state.lock().failures.clone()
    }

    pub fn sources(&self) -> Vec<SourceId> {
        let mut ids: Vec<_> = self.inner.state.lock().members.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.inner.config
    }
}

impl Inner {
    fn member_left(&self, handle: &SourceHandle, failure: Option<Arc<Error>>) {
        let mut state = self.state.lock();
        if state
            .members
            .get(handle.id())
            .is_some_and(|member| member.same_as(handle))
        {
            state.members.remove(handle.id());
        }

        if let Some(err) = failure {
            warn!(source = %handle.id(), %err, "aggregated source failed");
            self.record_failure(&mut state, handle.id(), err);
        }

        self.end_if_drained(&state);
    }

    fn record_failure(&self, state: &mut State, id: &SourceId, err: Arc<Error>) {
        if state.error.is_none() {
            state.error = Some(err.clone());
        }
        state.failures.push((id.clone(), err));
        if self.config.all_or_nothing {
            info!("closing aggregate after source failure");
            self.cancel.cancel();
        }
    }

    fn end_if_drained(&self, state: &State) {
        if self.config.end_on_exhaustion
            && state.members.is_empty()
            && state.holds == 0
            && !state.closing
        {
            debug!("last source left, closing aggregate");
            self.cancel.cancel();
        }
    }

    async fn shutdown(&self) {
        let members: Vec<SourceHandle> = {
            let mut state = self.state.lock();
            state.closing = true;
            state.members.values().cloned().collect()
        };
        for member in &members {
            member.close();
        }

        self.tasks.close();
        self.tasks.wait().await;

        // Only the first shutdown gets the sender.
        let out = self.state.lock().out.take();
        if out.is_some() {
            debug!(sources = members.len(), "aggregate closed");
        }
        drop(out);
        self.done.cancel();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn forward(
    inner: Arc<Inner>,
    handle: SourceHandle,
    mut rx: mpsc::Receiver<LogRecord>,
    out: mpsc::Sender<LogRecord>,
    lossy: bool,
) {
    let mut dropped = 0u64;
    loop {
        let record = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = out.closed() => {
                debug!("aggregate consumer went away");
                inner.cancel.cancel();
                break;
            }
            record = rx.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };

        if lossy {
            match out.try_send(record) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => dropped += 1,
                Err(TrySendError::Closed(_)) => {
                    inner.cancel.cancel();
                    break;
                }
            }
            continue;
        }

        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            res = out.send(record) => if res.is_err() {
                debug!("aggregate consumer went away");
                inner.cancel.cancel();
                break;
            },
        }
    }

    if dropped > 0 {
        debug!(source = %handle.id(), dropped, "dropped records from lossy source");
    }
    drop(out);
    inner.member_left(&handle, handle.err());
}
