use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use super::dispatcher::{shutdown_requested, JobDispatcher};
use crate::errors::TaskError;
use crate::models::{Task, TaskId, TaskPatch, TaskStatus};
use crate::services::{FileStore, TaskRegistry};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapReport {
    pub requeued: usize,
    pub abandoned: usize,
}

pub struct Reaper {
    registry: Arc<TaskRegistry>,
    dispatcher: JobDispatcher,
    files: Arc<FileStore>,
    max_attempts: u32,
    // How long a re-queued copy may wait before it is assumed lost.
    requeue_window: Duration,
    // Expired tasks already sent back to the queue: attempt and when.
    pending: HashMap<TaskId, (u32, DateTime<Utc>)>,
}

impl Reaper {
    pub fn new(
        registry: Arc<TaskRegistry>,
        dispatcher: JobDispatcher,
        files: Arc<FileStore>,
        max_attempts: u32,
        requeue_window: Duration,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            files,
            max_attempts,
            requeue_window,
            pending: HashMap::new(),
        }
    }

    async fn all_tasks(&self) -> Result<Vec<Task>, TaskError> {
        let mut tasks = Vec::new();
        for owner in self.registry.owners().await? {
            tasks.extend(self.registry.list_for_user(&owner).await?);
        }
        Ok(tasks)
    }

    /// Re-queues every `Queued` task. Run once before the server accepts
    /// requests.
    pub async fn recover_queued(&self) -> Result<usize, TaskError> {
        let mut requeued = 0;
        for task in self.all_tasks().await? {
            if task.status != TaskStatus::Queued {
                continue;
            }
            if let Err(e) = self.dispatcher.submit_job(task.id).await {
                tracing::warn!("Stopped recovery: {}", e);
                break;
            }
            requeued += 1;
        }

        if requeued > 0 {
            tracing::info!("Re-queued {} tasks left from a previous run", requeued);
        }
        Ok(requeued)
    }

    fn still_waiting(&self, task: &Task, now: DateTime<Utc>) -> bool {
        match self.pending.get(&task.id) {
            Some(&(attempt, queued_at)) if attempt == task.attempts => match (now - queued_at).to_std() {
                Ok(waited) => waited < self.requeue_window,
                Err(_) => true,
            },
            _ => false,
        }
    }

    pub async fn reclaim_expired(&mut self, now: DateTime<Utc>) -> Result<ReapReport, TaskError> {
        let mut report = ReapReport::default();
        let mut pending = HashMap::new();

        for task in self.all_tasks().await? {
            if task.status != TaskStatus::Processing || !task.lease_expired(now) {
                continue;
            }

            if task.attempts < self.max_attempts {
                // A copy from an earlier pass has not been claimed yet.
                if self.still_waiting(&task, now) {
                    if let Some(entry) = self.pending.get(&task.id) {
                        pending.insert(task.id.clone(), *entry);
                    }
                    continue;
                }

                tracing::warn!("Lease of task {} expired on attempt {}, re-queueing", task.id, task.attempts);
                if let Err(e) = self.dispatcher.submit_job(task.id.clone()).await {
                    tracing::warn!("Stopped reclaiming: {}", e);
                    break;
                }
                pending.insert(task.id, (task.attempts, now));
                report.requeued += 1;
                continue;
            }

            let detail = format!("abandoned after {} attempts", task.attempts);
            match self.registry.settle(&task, TaskStatus::Failed, TaskPatch::failed(detail, now)).await {
                Ok(_) => {
                    tracing::warn!("Task {} abandoned after {} attempts", task.id, task.attempts);
                    self.files.discard(&task.file_path).await;
                    report.abandoned += 1;
                }
                Err(e) if e.is_benign_race() => {
                    tracing::debug!("Task {} changed while reaping: {}", task.id, e)
                }
                Err(e) => tracing::error!("Failed to abandon task {}: {}", task.id, e),
            }
        }

        // Claimed, finished or deleted tasks drop out here.
        self.pending = pending;
        Ok(report)
    }

    pub async fn run(mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; start-up recovery already ran.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }

            match self.reclaim_expired(Utc::now()).await {
                Ok(report) if report != ReapReport::default() => {
                    tracing::info!(
                        "Reaper re-queued {} and abandoned {} tasks",
                        report.requeued,
                        report.abandoned
                    )
                }
                Ok(_) => {}
                Err(e) => tracing::error!("Reaper pass failed: {}", e),
            }
        }

        tracing::info!("Reaper stopped");
    }
}
