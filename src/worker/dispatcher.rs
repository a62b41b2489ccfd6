use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};

use crate::models::TaskId;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DispatchError {
    /// The pool is shutting down; the task stays `Queued` for startup recovery.
    #[error("job queue is closed, task {0} left queued")]
    Closed(TaskId),
}

/// Sending side, shared by the request layer and the reaper.
#[derive(Clone)]
pub struct JobDispatcher {
    tx: mpsc::Sender<TaskId>,
}

/// Receiving side, shared by all workers.
pub struct JobQueue {
    rx: Mutex<mpsc::Receiver<TaskId>>,
}

pub fn job_queue(capacity: usize) -> (JobDispatcher, JobQueue) {
    let (tx, rx) = mpsc::channel(capacity);
    (JobDispatcher { tx }, JobQueue { rx: Mutex::new(rx) })
}

impl JobDispatcher {
    /// Waits for room when the queue is full.
    pub async fn submit_job(&self, id: TaskId) -> Result<(), DispatchError> {
        tracing::debug!("Dispatching task {}", id);
        self.tx
            .send(id)
            .await
            .map_err(|mpsc::error::SendError(id)| DispatchError::Closed(id))
    }
}

impl JobQueue {
    /// Next job to run. Once `shutdown` flips, the queue is closed to new
    /// jobs and the ones already buffered are handed out until it is empty,
    /// after which this returns `None`.
    pub async fn next(&self, shutdown: &mut watch::Receiver<bool>) -> Option<TaskId> {
        if !*shutdown.borrow() {
            tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => {}
                id = async { self.rx.lock().await.recv().await } => return id,
            }
        }

        let mut rx = self.rx.lock().await;
        rx.close();
        rx.recv().await
    }
}

/// Resolves once shutdown was signalled or the signalling side is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
