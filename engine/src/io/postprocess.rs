//! Bounded postprocessing pool and tracked detached work.
//!
//! Terminal runs hand their postprocessing to a fixed set of workers over a
//! bounded queue. Review passes and cancellation cleanup run as detached tasks
//! owned by a [`TaskTracker`], so [`PostprocessPool::shutdown`] can wait for them.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::agents::Postprocessor;
use crate::core::types::{RunKey, RunStatus};
use crate::io::config::PostprocessConfig;

/// A finished run handed off for postprocessing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostprocessJob {
    pub key: RunKey,
    pub status: RunStatus,
}

pub struct PostprocessPool {
    tx: Option<mpsc::Sender<PostprocessJob>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl PostprocessPool {
    /// Start the workers. Must be called inside a tokio runtime.
    ///
    /// Without a handler no workers start and every job is dropped.
    pub fn start(cfg: &PostprocessConfig, handler: Option<Arc<dyn Postprocessor>>) -> Self {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let Some(handler) = handler else {
            return Self {
                tx: None,
                cancel,
                tracker,
            };
        };

        let (tx, rx) = mpsc::channel(cfg.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        for worker in 0..cfg.workers.max(1) {
            let rx = Arc::clone(&rx);
            let handler = Arc::clone(&handler);
            let cancel = cancel.clone();
            tracker.spawn(async move {
                worker_loop(worker, rx, handler, cancel).await;
            });
        }
        Self {
            tx: Some(tx),
            cancel,
            tracker,
        }
    }

    /// Hand off without blocking. A full queue drops the job with a warning.
    pub fn enqueue(&self, job: PostprocessJob) -> bool {
        let Some(tx) = &self.tx else {
            debug!(run_id = %job.key.run_id, "no postprocessor configured");
            return false;
        };
        match tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(run_id = %job.key.run_id, "postprocess queue full, job dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                warn!(run_id = %job.key.run_id, "postprocess pool closed, job dropped");
                false
            }
        }
    }

    /// Run work decoupled from the caller's lifetime; shutdown waits for it.
    pub fn spawn_detached<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(fut);
    }

    /// Stop the workers after the queued jobs and wait for all tracked work.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("postprocess pool stopped");
    }
}

async fn worker_loop(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<PostprocessJob>>>,
    handler: Arc<dyn Postprocessor>,
    cancel: CancellationToken,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                job = rx.recv() => job,
                _ = cancel.cancelled() => rx.try_recv().ok(),
            }
        };
        let Some(job) = job else {
            debug!(worker, "postprocess worker exiting");
            return;
        };
        if let Err(err) = handler.postprocess(&job).await {
            warn!(worker, run_id = %job.key.run_id, error = %format!("{err:#}"), "postprocess failed");
        }
    }
}
