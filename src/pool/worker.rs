//! Bounded worker pool
//!
//! A fixed number of workers drain a shared bounded queue. Submitting blocks
//! while the queue is full and silently discards the task once the pool has
//! been cancelled.
//!
//! ```text
//!   submit() ──► [ bounded queue (cap = workers) ] ──► worker 0..N ──► task.execute()
//!                          ▲
//!   stop(): cancel ────────┘ close ──► join all workers
//! ```

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::task::Task;

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Worker pool options
#[derive(Debug, Clone, Default)]
pub struct PoolOptions {
    /// Number of workers (0 = available parallelism)
    pub workers: usize,
}

impl PoolOptions {
    /// Set the number of workers
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    fn normalized_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

/// Fixed-size pool of async workers
pub struct WorkerPool {
    workers: usize,
    cancel: CancellationToken,
    state: AtomicU8,
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    receiver: Arc<AsyncMutex<mpsc::Receiver<Task>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a pool whose lifetime is bound to `parent`
    ///
    /// Cancelling `parent` stops accepting tasks, same as [`stop`](Self::stop)
    /// without the join.
    pub fn new(parent: &CancellationToken, options: PoolOptions) -> Self {
        let workers = options.normalized_workers();
        let (tx, rx) = mpsc::channel(workers);

        Self {
            workers,
            cancel: parent.child_token(),
            state: AtomicU8::new(STATE_IDLE),
            sender: Mutex::new(Some(tx)),
            receiver: Arc::new(AsyncMutex::new(rx)),
            handles: Mutex::new(Vec::with_capacity(workers)),
        }
    }

    /// Number of workers this pool runs
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Whether the pool has been stopped or its parent cancelled
    pub fn is_stopped(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_STOPPED || self.cancel.is_cancelled()
    }

    /// Spawn the workers
    ///
    /// Only the first call has any effect.
    pub fn start(&self) {
        if self
            .state
            .compare_exchange(STATE_IDLE, STATE_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let mut handles = self.handles.lock();
        for worker_id in 0..self.workers {
            let receiver = Arc::clone(&self.receiver);
            handles.push(tokio::spawn(run_worker(worker_id, receiver)));
        }

        tracing::debug!(workers = self.workers, "Worker pool started");
    }

    /// Queue a task for execution
    ///
    /// Waits for queue space. Returns `false` if the pool was cancelled, in
    /// which case the task is dropped and its handle reports
    /// [`Error::PoolStopped`](crate::error::Error::PoolStopped).
    pub async fn submit(&self, task: Task) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }

        let sender = match self.sender.lock().as_ref() {
            Some(tx) => tx.clone(),
            None => return false,
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = sender.send(task) => sent.is_ok(),
        }
    }

    /// Cancel the pool, close the queue and wait for every worker to exit
    ///
    /// Tasks already queued before the call still run.
    pub async fn stop(&self) {
        let prev = self.state.swap(STATE_STOPPED, Ordering::AcqRel);
        if prev == STATE_STOPPED {
            return;
        }

        self.cancel.cancel();
        self.sender.lock().take();

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Worker terminated abnormally");
            }
        }

        tracing::debug!(workers = self.workers, "Worker pool stopped");
    }
}

async fn run_worker(worker_id: usize, receiver: Arc<AsyncMutex<mpsc::Receiver<Task>>>) {
    loop {
        let task = receiver.lock().await.recv().await;
        match task {
            Some(task) => task.execute().await,
            None => break,
        }
    }

    tracing::trace!(worker_id = worker_id, "Worker exited");
}
