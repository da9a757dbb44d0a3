// ============================
// pika-backend-lib/src/persist.rs
// ============================
//! Per-session serialized persistence queue.
//!
//! Durable writes for one session must not reorder or overlap ("track
//! persisted" precedes "like for that track persisted"), but unrelated
//! sessions must not serialize against each other. Each session gets a
//! lazily-created FIFO worker task that runs one task to completion at a
//! time; the mpsc channel provides the ordering, the sequential `await`
//! provides the non-overlap. A failing task rejects only its own caller.

use crate::error::AppError;
use crate::metrics::PERSIST_FAILED;
use dashmap::DashMap;
use metrics::counter;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type TaskFuture = Pin<Box<dyn Future<Output = Result<(), AppError>> + Send>>;

struct Job {
    task: TaskFuture,
    done: oneshot::Sender<Result<(), AppError>>,
}

struct QueueHandle {
    tx: mpsc::UnboundedSender<Job>,
    worker: JoinHandle<()>,
}

/// One FIFO task queue per session, created on first use
#[derive(Default)]
pub struct PersistQueue {
    queues: DashMap<String, QueueHandle>,
}

impl PersistQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a durability task for the session. The returned receiver
    /// resolves when the task completes; callers that fire-and-forget may
    /// drop it, failures are logged either way.
    pub fn enqueue<F>(&self, session_id: &str, task: F) -> oneshot::Receiver<Result<(), AppError>>
    where
        F: Future<Output = Result<(), AppError>> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job = Job {
            task: Box::pin(task),
            done: done_tx,
        };

        let queue = self
            .queues
            .entry(session_id.to_string())
            .or_insert_with(|| spawn_worker(session_id.to_string()));

        if let Err(mpsc::error::SendError(job)) = queue.tx.send(job) {
            // queue raced with cleanup; surface the rejection to the caller
            let _ = job
                .done
                .send(Err(AppError::Internal("persistence queue closed".into())));
        }
        done_rx
    }

    /// Discard the session's queue entirely. Pending tasks are abandoned,
    /// not drained: durability for an ended session's final state must be
    /// enqueued before calling this.
    pub fn cleanup(&self, session_id: &str) {
        if let Some((_, handle)) = self.queues.remove(session_id) {
            handle.worker.abort();
        }
    }

    /// Number of live session queues (diagnostics)
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }
}

fn spawn_worker(session_id: String) -> QueueHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
    let worker = tokio::spawn(async move {
        // one task at a time, in enqueue order
        while let Some(job) = rx.recv().await {
            let result = job.task.await;
            if let Err(e) = &result {
                counter!(PERSIST_FAILED).increment(1);
                tracing::warn!(session = %session_id, error = %e, "persistence task failed");
            }
            let _ = job.done.send(result);
        }
    });
    QueueHandle { tx, worker }
}
