use crate::error::{CacheError, Result};
use crossbeam_channel::{Receiver, Sender};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::sync::oneshot;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Dispatch {
    Thread(Sender<Job>),
    Inline,
}

/// A single background thread that runs disk jobs for one cache instance in FIFO order.
///
/// Jobs submitted through the same worker never overlap, so the cache's disk state is
/// only ever touched by one job at a time. The thread exits once the worker is dropped
/// and the queue drains.
pub struct IoWorker {
    dispatch: Dispatch,
}

impl std::fmt::Debug for IoWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.dispatch {
            Dispatch::Thread(_) => "thread",
            Dispatch::Inline => "inline",
        };
        f.debug_struct("IoWorker").field("mode", &mode).finish()
    }
}

impl IoWorker {
    pub fn new(name: &str) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        match std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_jobs(rx))
        {
            Ok(_) => Self {
                dispatch: Dispatch::Thread(tx),
            },
            Err(err) => {
                // Thread creation can fail under tight process limits. Running jobs on the
                // caller keeps the cache correct, just not off-thread.
                tracing::warn!(
                    target = "brew.cache",
                    worker = name,
                    error = %err,
                    "failed to spawn cache worker; running jobs inline"
                );
                Self {
                    dispatch: Dispatch::Inline,
                }
            }
        }
    }

    /// Queues `job` without waiting for it.
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        match &self.dispatch {
            Dispatch::Thread(tx) => {
                if tx.send(Box::new(job)).is_err() {
                    tracing::debug!(target = "brew.cache", "cache worker queue closed; dropping job");
                }
            }
            Dispatch::Inline => run_guarded(Box::new(job)),
        }
    }

    /// Queues `job` and resolves with its return value.
    pub fn run<T, F>(&self, job: F) -> impl Future<Output = Result<T>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.spawn(move || {
            // The caller may have stopped waiting; the job still ran to completion.
            let _ = tx.send(job());
        });
        async move { rx.await.map_err(|_| CacheError::WorkerUnavailable) }
    }
}

fn run_jobs(rx: Receiver<Job>) {
    for job in rx {
        run_guarded(job);
    }
}

fn run_guarded(job: Job) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
        let message = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("<non-string panic payload>");
        tracing::warn!(target = "brew.cache", panic = message, "cache job panicked");
    }
}
