//! Key-scoped leading/trailing debouncing.
//!
//! The first call for an idle key fires the callback right away and arms a
//! quiet window. Calls landing inside the window only replace the pending
//! payload and push the deadline out; once the window passes untouched the
//! last payload is delivered. Every pending key owns one timer task, so a
//! burst on one key never holds back another.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
mod tests;

type Callback<P> = Arc<dyn Fn(P) + Send + Sync>;

pub struct Debouncer<K, P> {
    inner: Arc<Inner<K, P>>,
}

struct Inner<K, P> {
    window: Duration,
    callback: Callback<P>,
    cancel: CancellationToken,
    slots: Mutex<HashMap<K, Slot<P>>>,
}

struct Slot<P> {
    latest: Option<P>,
    deadline: Instant,
}

impl<K, P> Clone for Debouncer<K, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, P> Debouncer<K, P>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    P: Send + 'static,
{
    pub fn new<F>(cancel: CancellationToken, window: Duration, callback: F) -> Self
    where
        F: Fn(P) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                window,
                callback: Arc::new(callback),
                cancel,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn debounce(&self, key: K, payload: P) {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return;
        }

        let deadline = Instant::now() + inner.window;
        let mut slots = inner.slots.lock();
        if let Some(slot) = slots.get_mut(&key) {
            slot.latest = Some(payload);
            slot.deadline = deadline;
            return;
        }
        slots.insert(
            key.clone(),
            Slot {
                latest: None,
                deadline,
            },
        );
        drop(slots);

        tokio::spawn(run_key(inner.clone(), key, payload));
    }

    /// Number of keys currently inside a quiet window.
    pub fn pending(&self) -> usize {
        self.inner.slots.lock().len()
    }
}

impl<K, P> Inner<K, P> {
    fn fire(&self, payload: P) {
        if !self.cancel.is_cancelled() {
            (self.callback)(payload);
        }
    }
}

async fn run_key<K, P>(inner: Arc<Inner<K, P>>, key: K, leading: P)
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    P: Send + 'static,
{
    inner.fire(leading);

    loop {
        let trailing = loop {
            let deadline = match inner.slots.lock().get(&key) {
                Some(slot) => slot.deadline,
                None => return,
            };

            tokio::select! {
                _ = inner.cancel.cancelled() => {
                    inner.slots.lock().remove(&key);
                    return;
                }
                _ = tokio::time::sleep_until(deadline) => {}
            }

            let mut slots = inner.slots.lock();
            let Some(slot) = slots.get_mut(&key) else {
                return;
            };
            if slot.deadline <= Instant::now() {
                match slot.latest.take() {
                    Some(payload) => break payload,
                    None => {
                        slots.remove(&key);
                        return;
                    }
                }
            }
        };

        inner.fire(trailing);

        // A call that landed while the trailing callback ran opens a new burst.
        let next = {
            let mut slots = inner.slots.lock();
            let Some(slot) = slots.get_mut(&key) else {
                return;
            };
            match slot.latest.take() {
                Some(payload) => {
                    slot.deadline = Instant::now() + inner.window;
                    payload
                }
                None => {
                    slots.remove(&key);
                    return;
                }
            }
        };
        inner.fire(next);
    }
}
