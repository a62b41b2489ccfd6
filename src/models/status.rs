use serde::Serialize;
use chrono::{DateTime, Utc};
use super::task::{ResultMap, Task, TaskId, TaskStatus};

/// What pollers and dashboard rows get to see of a task.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct StatusPayload {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub filename: String,
    pub submit_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complete_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

/// Where an owner stands against both limits: stored tasks and processing
/// time.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaUsage {
    pub task_count: usize,
    pub max_tasks: usize,
    pub quota_used: u64,   // seconds
    pub quota_total: u64,  // seconds
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TaskListing {
    pub tasks: Vec<StatusPayload>,
    #[serde(flatten)]
    pub usage: QuotaUsage,
}

pub fn project(task: &Task) -> StatusPayload {
    let (complete_time, result, error_detail) = match task.status {
        TaskStatus::Queued | TaskStatus::Processing => (None, None, None),
        TaskStatus::Completed => (task.complete_time, task.result.clone(), None),
        TaskStatus::Failed => (task.complete_time, None, task.error_detail.clone()),
    };

    StatusPayload {
        task_id: task.id.clone(),
        status: task.status,
        filename: task.filename.clone(),
        submit_time: task.submit_time,
        complete_time,
        result,
        error_detail,
    }
}
