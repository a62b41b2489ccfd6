use std::time::Duration;

use thiserror::Error;
use crate::models::TaskStatus;
use super::store::StoreError;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("quota exceeded: {current} of {max} tasks in use")]
    QuotaExceeded { current: usize, max: usize },

    #[error("task {0} not found")]
    NotFound(String),

    #[error("task {0} belongs to another user")]
    Forbidden(String),

    /// Another writer already moved the task; callers drop their work.
    #[error("task {0} was changed by another writer")]
    StaleTransition(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("task result not ready, status is {0}")]
    NotReady(TaskStatus),

    #[error("task {0} already exists")]
    Duplicate(String),

    #[error("lease of {0:?} is out of range")]
    LeaseOutOfRange(Duration),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TaskError {
    /// Lost races the worker side swallows instead of reporting.
    pub fn is_benign_race(&self) -> bool {
        matches!(self, TaskError::StaleTransition(_) | TaskError::NotFound(_))
    }
}
