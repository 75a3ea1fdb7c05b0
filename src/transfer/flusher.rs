//! Background flusher queue.
//!
//! A bounded channel of per-file flush requests drained by a small worker
//! pool. Enqueueing never blocks; a full queue makes the caller fall back
//! to a synchronous flush. Each request runs under a fresh deadline so an
//! already-answered client request cannot abort background work.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::warn;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::blockstore::BoxFut;
use crate::handle::FileHandle;
use crate::tools::epoch_now;

#[derive(Clone, Debug)]
pub struct FlusherConfig {
    pub queue_capacity: usize,
    pub workers: usize,
    /// Per-request deadline, independent of the originating request.
    pub request_timeout: Duration,
    pub stop_grace: Duration,
}

impl Default for FlusherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            workers: 4,
            request_timeout: Duration::from_secs(300),
            stop_grace: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FlushRequest {
    pub share: String,
    pub handle: FileHandle,
    pub payload_id: String,
}

/// Whatever executes a flush request; implemented by the transfer manager.
pub trait FlushTarget: Send + Sync {
    fn flush<'a>(&'a self, req: &'a FlushRequest) -> BoxFut<'a, ()>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub pending: u64,
    pub completed: u64,
    pub failed: u64,
    pub last_error: Option<(String, i64)>,
}

#[derive(Default)]
struct FlushCounters {
    pending: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    last_error: Mutex<Option<(String, i64)>>,
}

impl FlushCounters {
    fn record_failure(&self, message: String) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        *self.last_error.lock().unwrap() = Some((message, epoch_now()));
    }
}

pub struct Flusher {
    tx: Mutex<Option<mpsc::Sender<FlushRequest>>>,
    // Keeps the channel open independently of the worker count.
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<FlushRequest>>>,
    counters: Arc<FlushCounters>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stop_grace: Duration,
}

impl Flusher {
    /// Spawns the worker pool. The target is held weakly so a dropped
    /// transfer manager stops the workers instead of leaking them.
    pub fn start(config: FlusherConfig, target: Weak<dyn FlushTarget>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let counters = Arc::new(FlushCounters::default());

        let mut workers = Vec::with_capacity(config.workers);
        for _ in 0..config.workers {
            let rx = Arc::clone(&rx);
            let counters = Arc::clone(&counters);
            let target = target.clone();
            let timeout = config.request_timeout;
            workers.push(tokio::spawn(async move {
                loop {
                    let req = { rx.lock().await.recv().await };
                    let req = match req {
                        Some(req) => req,
                        None => break,
                    };
                    counters.pending.fetch_sub(1, Ordering::SeqCst);
                    let target = match target.upgrade() {
                        Some(target) => target,
                        None => break,
                    };
                    match tokio::time::timeout(timeout, target.flush(&req)).await {
                        Ok(Ok(())) => {
                            counters.completed.fetch_add(1, Ordering::SeqCst);
                        }
                        Ok(Err(err)) => {
                            warn!("background flush of {} failed: {}", req.payload_id, err);
                            counters.record_failure(err.to_string());
                        }
                        Err(_) => {
                            warn!(
                                "background flush of {} timed out after {:?}",
                                req.payload_id, timeout
                            );
                            counters.record_failure("flush timed out".to_string());
                        }
                    }
                }
            }));
        }

        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            rx,
            counters,
            workers: Mutex::new(workers),
            stop_grace: config.stop_grace,
        })
    }

    pub fn stop_grace(&self) -> Duration {
        self.stop_grace
    }

    /// Non-blocking enqueue; false when the queue is full or closed.
    pub fn enqueue(&self, req: FlushRequest) -> bool {
        let guard = self.tx.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => match tx.try_send(req) {
                Ok(()) => {
                    self.counters.pending.fetch_add(1, Ordering::SeqCst);
                    true
                }
                Err(_) => false,
            },
            None => false,
        }
    }

    /// Closes the intake, lets the workers drain the queue and waits for
    /// them up to `timeout`.
    pub async fn stop(&self, timeout: Duration) {
        drop(self.tx.lock().unwrap().take());
        let workers: Vec<JoinHandle<()>> = self.workers.lock().unwrap().drain(..).collect();
        if workers.is_empty() {
            return;
        }
        let join = futures::future::join_all(workers);
        if tokio::time::timeout(timeout, join).await.is_err() {
            warn!("flusher workers did not drain within {:?}", timeout);
        }
    }

    pub fn stats(&self) -> FlushStats {
        FlushStats {
            pending: self.counters.pending.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            last_error: self.counters.last_error.lock().unwrap().clone(),
        }
    }
}
