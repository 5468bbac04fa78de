//! Pool tasks
//!
//! A [`Task`] owns a boxed future. Its output is delivered through a
//! single-slot [`TaskHandle`] so the submitter can await the result.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::oneshot;

use crate::error::{Error, Result};

type BoxedJob = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Unit of work executed by a worker
pub struct Task {
    job: BoxedJob,
}

impl Task {
    /// Create a task and the handle that will receive its result
    pub fn new<T, F>(fut: F) -> (Self, TaskHandle<T>)
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = Box::pin(async move {
            let result = fut.await;
            // Receiver may have been dropped; fire-and-forget submitters do that.
            let _ = tx.send(result);
        });

        (Self { job }, TaskHandle { rx })
    }

    /// Create a task whose result nobody waits for
    pub fn detached<F>(fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self { job: Box::pin(fut) }
    }

    /// Run the task to completion
    pub async fn execute(self) {
        self.job.await
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").finish_non_exhaustive()
    }
}

/// Single-slot future for a task result
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Wait for the task result
    ///
    /// Returns [`Error::PoolStopped`] if the task was discarded without
    /// running.
    pub async fn result(self) -> Result<T> {
        self.rx.await.map_err(|_| Error::PoolStopped)?
    }
}
