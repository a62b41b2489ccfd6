use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;

use super::files::FileStore;
use super::quota::{Admission, QuotaGuard};
use super::registry::TaskRegistry;
use crate::errors::TaskError;
use crate::models::{project, ResultMap, StatusPayload, Task, TaskId, TaskListing, TaskParams, TaskStatus};
use crate::worker::JobDispatcher;

#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub path: PathBuf,
}

pub struct TaskService {
    registry: Arc<TaskRegistry>,
    quota: QuotaGuard,
    dispatcher: JobDispatcher,
    files: Arc<FileStore>,
}

impl TaskService {
    pub fn new(
        registry: Arc<TaskRegistry>,
        quota: QuotaGuard,
        dispatcher: JobDispatcher,
        files: Arc<FileStore>,
    ) -> Self {
        Self { registry, quota, dispatcher, files }
    }

    /// Records a new task and queues it. The upload is discarded when the
    /// task could not be recorded.
    pub async fn submit(&self, owner: &str, upload: Upload, params: TaskParams) -> Result<TaskId, TaskError> {
        match self.record(owner, &upload, params).await {
            Ok(task) => {
                if let Err(e) = self.dispatcher.submit_job(task.id.clone()).await {
                    // Still Queued in the store; picked up again on the next start.
                    tracing::warn!("{}", e);
                }
                tracing::info!("Accepted task {} ({}) for user {}", task.id, task.filename, owner);
                Ok(task.id)
            }
            Err(e) => {
                self.files.discard(&upload.path).await;
                Err(e)
            }
        }
    }

    async fn record(&self, owner: &str, upload: &Upload, params: TaskParams) -> Result<Task, TaskError> {
        if let Admission::Deny { current, max } = self.quota.admit(owner).await? {
            return Err(TaskError::QuotaExceeded { current, max });
        }

        let file_path = upload.path.to_string_lossy();
        self.registry.create(owner, &upload.filename, &file_path, params).await
    }

    pub async fn get_status(&self, id: &TaskId, owner: &str) -> Result<StatusPayload, TaskError> {
        let task = self.owned(id, owner).await?;
        tracing::debug!("Task {} status: {}", id, task.status);
        Ok(project(&task))
    }

    pub async fn list_tasks(&self, owner: &str) -> Result<Vec<StatusPayload>, TaskError> {
        let tasks = self.registry.list_for_user(owner).await?;
        Ok(tasks.iter().map(project).collect())
    }

    /// The owner's tasks together with where they stand against both quotas.
    pub async fn listing(&self, owner: &str) -> Result<TaskListing, TaskError> {
        let tasks = self.list_tasks(owner).await?;
        let usage = self.quota.usage(owner).await?;
        Ok(TaskListing { tasks, usage })
    }

    /// Deleting a task that is still running does not stop the analysis;
    /// the worker notices when it tries to record the outcome.
    pub async fn delete_task(&self, id: &TaskId, owner: &str) -> Result<(), TaskError> {
        let task = self.registry.delete(id, owner).await?;
        // A live worker discards its own input once it settles. Past the
        // lease nobody will.
        let worker_alive = task.status == TaskStatus::Processing && !task.lease_expired(Utc::now());
        if !worker_alive {
            self.files.discard(&task.file_path).await;
        }
        Ok(())
    }

    pub async fn download_result(&self, id: &TaskId, owner: &str) -> Result<ResultMap, TaskError> {
        let task = self.owned(id, owner).await?;
        match (task.status, task.result) {
            (TaskStatus::Completed, Some(result)) => Ok(result),
            (status, _) => Err(TaskError::NotReady(status)),
        }
    }

    async fn owned(&self, id: &TaskId, owner: &str) -> Result<Task, TaskError> {
        let task = self.registry.get(id).await?;
        if task.owner != owner {
            tracing::warn!("User {} asked for task {} owned by someone else", owner, id);
            return Err(TaskError::Forbidden(id.to_string()));
        }
        Ok(task)
    }
}
