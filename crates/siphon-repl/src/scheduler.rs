//! Per-key FIFO scheduler with unbounded parallelism across distinct keys.
//!
//! The scheduler maps a canonical key (`bucket/objectKey[?versionId]`) to a
//! pending work queue. The first job pushed for an idle key dispatches
//! immediately on its own worker; later jobs for the same key wait until
//! every predecessor has completed. Completion, not success, unblocks the
//! next job: a job that resolves to a failure still releases its slot. The
//! per-key queues are the engine's sole mutex-equivalent construct.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Ordering scheduler keyed by canonical object identity.
pub struct KeyScheduler {
    queues: Arc<Mutex<HashMap<String, VecDeque<Job>>>>,
    in_flight: Arc<AtomicUsize>,
    quiescent: Arc<Notify>,
}

impl KeyScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            quiescent: Arc::new(Notify::new()),
        }
    }

    /// Submit a job under `key`.
    ///
    /// If the key is idle the job dispatches immediately; otherwise it is
    /// appended to the key's queue and becomes eligible only after every
    /// predecessor for the same key has completed. Jobs must not panic: a
    /// panicking job poisons its key's slot.
    pub async fn push<F>(&self, key: &str, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut queues = self.queues.lock().await;
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        if let Some(queue) = queues.get_mut(key) {
            queue.push_back(Box::pin(job));
            return;
        }
        queues.insert(key.to_string(), VecDeque::new());
        drop(queues);

        let key = key.to_string();
        let queues = self.queues.clone();
        let in_flight = self.in_flight.clone();
        let quiescent = self.quiescent.clone();
        tokio::spawn(async move {
            let mut current: Job = Box::pin(job);
            loop {
                current.await;
                let mut queues = queues.lock().await;
                let remaining = in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
                match queues.get_mut(&key).and_then(VecDeque::pop_front) {
                    Some(next) => {
                        drop(queues);
                        current = next;
                    }
                    None => {
                        queues.remove(&key);
                        drop(queues);
                        if remaining == 0 {
                            quiescent.notify_waiters();
                        }
                        break;
                    }
                }
            }
        });
    }

    /// Number of keys with a running or queued job.
    pub async fn active_keys(&self) -> usize {
        self.queues.lock().await.len()
    }

    /// Number of jobs queued (not yet dispatched) behind `key`.
    pub async fn queue_depth(&self, key: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(key)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Total jobs running or queued across all keys.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until every submitted job has completed.
    pub async fn idle(&self) {
        loop {
            let notified = self.quiescent.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for KeyScheduler {
    fn default() -> Self {
        Self::new()
    }
}
