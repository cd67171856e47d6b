//! One tailable log origin wrapped around a node-local tail backend.

use crate::error::{Error, Result};
use crate::types::{Line, LogRecord, SourceId, SourceState};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};


const DEFAULT_BUFFER: usize = 256;

/// The node-local tail contract: something that can be opened and then
/// pushes lines until it runs dry, fails, or is cancelled.
#[async_trait]
pub trait Tail: Send + 'static {
    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    /// Returns `Ok(())` once the origin is exhausted. Must return promptly
    /// after `cancel` fires.
    async fn follow(self: Box<Self>, sink: &mut LineSink, cancel: CancellationToken) -> Result<()>;

    /// Lossy origins may have records dropped under backpressure.
    fn lossy(&self) -> bool {
        false
    }
}

/// Stamps lines with their source and sequence number on the way out.
pub struct LineSink {
    source: Arc<SourceId>,
    seq: u64,
    tx: mpsc::Sender<LogRecord>,
    cancel: CancellationToken,
}

impl LineSink {
    /// Fails with [`Error::Closed`] once the receiver is gone or the source
    /// is cancelled.
    pub async fn send(&mut self, line: Line) -> Result<()> {
        self.seq += 1;
        let record = LogRecord {
            source: self.source.clone(),
            seq: self.seq,
            timestamp: line.timestamp,
            message: line.message,
            metadata: line.metadata,
        };
        tokio::select! {
            res = self.tx.send(record) => res.map_err(|_| Error::Closed),
            _ = self.cancel.cancelled() => Err(Error::Closed),
        }
    }

    pub fn delivered(&self) -> u64 {
        self.seq
    }
}

struct Shared {
    state: Mutex<SourceState>,
    err: Mutex<Option<Arc<Error>>>,
    cancel: Mutex<CancellationToken>,
}

impl Shared {
    fn finish(&self, id: &SourceId, result: Result<()>, cancel: &CancellationToken) {
        let mut state = self.state.lock();
        match result {
            Ok(()) | Err(Error::Closed) if cancel.is_cancelled() || *state == SourceState::Closed => {
                *state = SourceState::Closed;
            }
            Ok(()) | Err(Error::Closed) => {
                debug!(source = %id, "source exhausted");
                *state = SourceState::Exhausted;
            }
            Err(_) if cancel.is_cancelled() => {
                *state = SourceState::Closed;
            }
            Err(err) => {
                warn!(source = %id, %err, "source failed");
                *state = SourceState::Failed;
                *self.err.lock() = Some(Arc::new(err));
            }
        }
    }
}

/// Cheap clonable view of a [`StreamSource`] for registries.
#[derive(Clone)]
pub struct SourceHandle {
    id: Arc<SourceId>,
    shared: Arc<Shared>,
}

impl SourceHandle {
    pub fn id(&self) -> &SourceId {
        &self.id
    }

    pub fn state(&self) -> SourceState {
        *self.shared.state.lock()
    }

    pub fn err(&self) -> Option<Arc<Error>> {
        self.shared.err.lock().clone()
    }

    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            if matches!(*state, SourceState::Idle | SourceState::Open) {
                *state = SourceState::Closed;
            }
        }
        self.shared.cancel.lock().cancel();
    }

    pub fn same_as(&self, other: &SourceHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

pub struct StreamSource {
    handle: SourceHandle,
    tail: Option<Box<dyn Tail>>,
    rx: Option<mpsc::Receiver<LogRecord>>,
    buffer: usize,
    lossy: bool,
}

impl StreamSource {
    pub fn new(id: SourceId, tail: impl Tail) -> Self {
        let lossy = tail.lossy();
        Self {
            handle: SourceHandle {
                id: Arc::new(id),
                shared: Arc::new(Shared {
                    state: Mutex::new(SourceState::Idle),
                    err: Mutex::new(None),
                    cancel: Mutex::new(CancellationToken::new()),
                }),
            },
            tail: Some(Box::new(tail)),
            rx: None,
            buffer: DEFAULT_BUFFER,
            lossy,
        }
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    pub fn id(&self) -> &SourceId {
        self.handle.id()
    }

    pub fn handle(&self) -> SourceHandle {
        self.handle.clone()
    }

    pub fn lossy(&self) -> bool {
        self.lossy
    }

    /// Opens the backend and spawns the follow task. Open failures are
    /// returned and also parked in [`StreamSource::err`].
    pub async fn start(&mut self, parent: &CancellationToken) -> Result<()> {
        let id = self.handle.id.clone();
        if self.state() == SourceState::Closed {
            return Err(Error::Closed);
        }
        let mut tail = self
            .tail
            .take()
            .ok_or_else(|| Error::usage(format!("source {} already started", id)))?;

        let cancel = parent.child_token();
        *self.handle.shared.cancel.lock() = cancel.clone();

        if let Err(err) = tail.open().await {
            let returned = Error::source_failed(&id, &err);
            *self.handle.shared.state.lock() = SourceState::Failed;
            *self.handle.shared.err.lock() = Some(Arc::new(err));
            return Err(returned);
        }

        let (tx, rx) = mpsc::channel(self.buffer);
        self.rx = Some(rx);
        {
            let mut state = self.handle.shared.state.lock();
            if *state == SourceState::Closed {
                // Closed while opening.
                return Ok(());
            }
            *state = SourceState::Open;
        }
        debug!(source = %id, "source started");

        let shared = self.handle.shared.clone();
        tokio::spawn(async move {
            let mut sink = LineSink {
                source: id.clone(),
                seq: 0,
                tx,
                cancel: cancel.clone(),
            };
            let result = tail.follow(&mut sink, cancel.clone()).await;
            // Park the outcome before the channel closes so that consumers
            // observing end-of-stream also observe the error.
            shared.finish(&id, result, &cancel);
            drop(sink);
        });
        Ok(())
    }

    /// The record channel. Before `start`, or once taken, this is an empty
    /// closed receiver.
    pub fn records(&mut self) -> mpsc::Receiver<LogRecord> {
        self.rx.take().unwrap_or_else(|| {
            let (_, rx) = mpsc::channel(1);
            rx
        })
    }

    pub fn sources(&self) -> Vec<SourceId> {
        vec![self.id().clone()]
    }

    pub fn state(&self) -> SourceState {
        self.handle.state()
    }

    pub fn err(&self) -> Option<Arc<Error>> {
        self.handle.err()
    }

    pub fn close(&self) {
        self.handle.close();
    }
}
