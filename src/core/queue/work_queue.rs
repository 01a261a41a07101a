use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

/// FIFO queue of keys with duplicate collapse and in-flight tracking.
///
/// - An item that is already waiting is not queued twice.
/// - An item handed out by `get` is "processing" until `done` is called;
///   adding it in the meantime marks it dirty and it is re-queued exactly once
///   by `done`, so no two workers ever hold the same item.
///
/// Cloning yields another handle to the same queue.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

struct QueueState<T> {
    queue: VecDeque<T>,
    /// Items that need processing (queued, or re-added while processing)
    dirty: HashSet<T>,
    /// Items currently handed out to a worker
    processing: HashSet<T>,
    shutting_down: bool,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Hash + Eq + Clone> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Hash + Eq + Clone> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark `item` as needing processing.
    pub fn add(&self, item: T) {
        {
            let mut state = self.lock();
            if state.shutting_down || state.dirty.contains(&item) {
                return;
            }

            state.dirty.insert(item.clone());
            if state.processing.contains(&item) {
                // Picked up again by done()
                return;
            }
            state.queue.push_back(item);
        }
        self.inner.notify.notify_one();
    }

    /// Wait for the next item. Returns `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            // Registered before inspecting the state so a concurrent add or
            // shut_down between the check and the await is not missed
            let notified = self.inner.notify.notified();

            {
                let mut state = self.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark `item` as finished. Must be called once for every item returned by `get`.
    pub fn done(&self, item: &T) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(item);
            if state.dirty.contains(item) {
                state.queue.push_back(item.clone());
                true
            } else {
                false
            }
        };

        if requeued {
            self.inner.notify.notify_one();
        }
    }

    /// Stop accepting items and wake every waiting `get`.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of items waiting to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
