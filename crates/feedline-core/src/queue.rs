//! Bounded worker pool
//!
//! A fixed number of workers drain a bounded channel. Producers block in
//! [`WorkQueue::enqueue`] once `max_pending` items are waiting, so memory stays
//! bounded when processing is slower than production.
//!
//! The first item that fails or panics stops the whole queue: its error is logged, the
//! remaining workers stop taking work, items still in the channel are
//! abandoned, and [`WorkQueue::complete`] returns that error. Abandoned items
//! are picked up again when the stage re-runs the same commits.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::{DEFAULT_MAX_PENDING, DEFAULT_WORKER_COUNT};

#[derive(Error, Debug)]
pub enum WorkQueueError {
    #[error("Work item failed: {0:#}")]
    Worker(anyhow::Error),

    /// A handler panicked, or a worker task was aborted
    #[error("Worker task panicked or was aborted: {0}")]
    Join(#[from] JoinError),

    /// A worker failed or `abort` was called; `complete` reports why
    #[error("Work queue stopped accepting items")]
    Aborted,

    #[error("Work queue was cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkQueueConfig {
    pub worker_count: usize,
    pub max_pending: usize,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

pub struct WorkQueue<T> {
    sender: mpsc::Sender<T>,
    workers: JoinSet<Result<(), WorkQueueError>>,
    /// Fired by the first failure, by `abort`, or by the caller's token
    stop: CancellationToken,
    cancel: CancellationToken,
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Spawn the workers. They idle until items arrive.
    pub fn start<F, Fut>(config: WorkQueueConfig, cancel: CancellationToken, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let worker_count = config.worker_count.max(1);
        let (sender, receiver) = mpsc::channel(config.max_pending.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let handler = Arc::new(handler);
        let stop = cancel.child_token();

        let mut workers = JoinSet::new();
        for worker in 0..worker_count {
            let receiver = Arc::clone(&receiver);
            let handler = Arc::clone(&handler);
            let stop = stop.clone();

            workers.spawn(async move {
                loop {
                    let next = {
                        let mut receiver = receiver.lock().await;
                        tokio::select! {
                            biased;
                            _ = stop.cancelled() => None,
                            item = receiver.recv() => item,
                        }
                    };
                    let Some(item) = next else { break };

                    // Own task, so a panicking handler fails the queue like an error.
                    match tokio::spawn(handler(item)).await {
                        Ok(Ok(())) => {},
                        Ok(Err(err)) => {
                            error!(worker, error = %format!("{err:#}"), "Work item failed; stopping queue");
                            stop.cancel();
                            return Err(WorkQueueError::Worker(err));
                        },
                        Err(err) => {
                            error!(worker, error = %err, "Work item panicked; stopping queue");
                            stop.cancel();
                            return Err(WorkQueueError::Join(err));
                        },
                    }
                }
                debug!(worker, "Worker finished");
                Ok(())
            });
        }

        debug!(worker_count, max_pending = config.max_pending, "Work queue started");

        Self {
            sender,
            workers,
            stop,
            cancel,
        }
    }

    /// Hand an item to the workers, waiting while the queue is full
    pub async fn enqueue(&self, item: T) -> Result<(), WorkQueueError> {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => Err(self.stopped_error()),
            sent = self.sender.send(item) => sent.map_err(|_| WorkQueueError::Aborted),
        }
    }

    /// Stop handing out queued items; in-flight items finish
    pub fn abort(&self) {
        self.stop.cancel();
    }

    fn stopped_error(&self) -> WorkQueueError {
        if self.cancel.is_cancelled() {
            WorkQueueError::Cancelled
        } else {
            WorkQueueError::Aborted
        }
    }

    /// Close the queue, wait for every worker, and return the first failure
    pub async fn complete(self) -> Result<(), WorkQueueError> {
        let Self {
            sender,
            mut workers,
            stop,
            cancel,
        } = self;
        drop(sender);

        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            let failure = match joined {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err),
                Err(err) => {
                    stop.cancel();
                    Some(WorkQueueError::Join(err))
                },
            };
            if first_error.is_none() {
                first_error = failure;
            }
        }

        match first_error {
            Some(err) => Err(err),
            None if cancel.is_cancelled() => Err(WorkQueueError::Cancelled),
            None if stop.is_cancelled() => Err(WorkQueueError::Aborted),
            None => Ok(()),
        }
    }
}
