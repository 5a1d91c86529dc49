//! Concurrency-limited FIFO task queue
//!
//! Tasks wait in arrival order and are started as soon as a worker slot is
//! free. Waiting tasks can be removed before they start; removing one drops
//! its future, which runs whatever guards it owns.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

/// Error type a queued task may return. Logged, never propagated.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed unit of work accepted by the queue
pub type Task = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send + 'static>>;

/// A task that has not started yet
pub struct QueueEntry<K> {
    pub id: K,
    task: Task,
}

impl<K: Debug> Debug for QueueEntry<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEntry").field("id", &self.id).finish()
    }
}

struct State<K> {
    waiting: VecDeque<QueueEntry<K>>,
    active: usize,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    concurrency: usize,
    idle: Notify,
}

impl<K> Inner<K> {
    fn state(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Bounded worker pool executing tasks in FIFO order
///
/// Cheap to clone; clones share the same queue.
pub struct TaskQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for TaskQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> TaskQueue<K>
where
    K: Clone + Debug + Send + 'static,
{
    /// Create a queue running at most `concurrency` tasks at once (minimum 1)
    pub fn new(concurrency: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    waiting: VecDeque::new(),
                    active: 0,
                }),
                concurrency: concurrency.max(1),
                idle: Notify::new(),
            }),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    /// Append a task and start it immediately if a slot is free
    ///
    /// Must be called from within a tokio runtime.
    pub fn add<F>(&self, id: K, task: F)
    where
        F: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.inner.state().waiting.push_back(QueueEntry {
            id,
            task: Box::pin(task),
        });
        Self::pump(&self.inner);
    }

    /// Remove and return every waiting entry whose id matches
    ///
    /// Running tasks are never affected.
    pub fn remove<P>(&self, mut predicate: P) -> Vec<QueueEntry<K>>
    where
        P: FnMut(&K) -> bool,
    {
        let removed = {
            let mut state = self.inner.state();
            let mut removed = Vec::new();
            let mut kept = VecDeque::with_capacity(state.waiting.len());
            for entry in state.waiting.drain(..) {
                if predicate(&entry.id) {
                    removed.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            state.waiting = kept;
            removed
        };
        self.notify_if_idle();
        removed
    }

    /// Drop every waiting entry, returning how many were removed
    pub fn clear(&self) -> usize {
        let drained: Vec<QueueEntry<K>> = self.inner.state().waiting.drain(..).collect();
        let count = drained.len();
        // futures are dropped outside the lock so their guards may call back in
        drop(drained);
        self.notify_if_idle();
        count
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state().waiting.len()
    }

    pub fn active_count(&self) -> usize {
        self.inner.state().active
    }

    /// Ids of waiting entries in queue order
    pub fn waiting_ids(&self) -> Vec<K> {
        self.inner.state().waiting.iter().map(|e| e.id.clone()).collect()
    }

    /// Resolve once nothing is waiting and nothing is running
    pub async fn idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            {
                let state = self.inner.state();
                if state.waiting.is_empty() && state.active == 0 {
                    return;
                }
            }
            notified.await;
        }
    }

    fn notify_if_idle(&self) {
        let idle = {
            let state = self.inner.state();
            state.waiting.is_empty() && state.active == 0
        };
        if idle {
            self.inner.idle.notify_waiters();
        }
    }

    fn pump(inner: &Arc<Inner<K>>) {
        loop {
            let entry = {
                let mut state = inner.state();
                if state.active >= inner.concurrency {
                    return;
                }
                match state.waiting.pop_front() {
                    Some(entry) => {
                        state.active += 1;
                        entry
                    }
                    None => return,
                }
            };

            let inner = inner.clone();
            tokio::spawn(async move {
                let QueueEntry { id, task } = entry;
                debug!(task = ?id, "queue task started");

                // run in its own task so a panic is contained and observed
                match tokio::spawn(task).await {
                    Ok(Ok(())) => debug!(task = ?id, "queue task finished"),
                    Ok(Err(e)) => warn!(task = ?id, error = %e, "queue task failed"),
                    Err(e) if e.is_panic() => error!(task = ?id, "queue task panicked"),
                    Err(e) => warn!(task = ?id, error = %e, "queue task aborted"),
                }

                let idle = {
                    let mut state = inner.state();
                    state.active -= 1;
                    state.waiting.is_empty() && state.active == 0
                };
                Self::pump(&inner);
                if idle {
                    inner.idle.notify_waiters();
                }
            });
        }
    }
}
