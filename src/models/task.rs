use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use crate::errors::TaskError;

/// Motif string to score, as produced by the analysis engine.
pub type ResultMap = HashMap<String, u32>;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Edges of the lifecycle: `Queued -> Processing -> {Completed | Failed}`.
    /// `Processing -> Processing` is the lease reclaim edge.
    pub fn can_advance_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Queued, Processing) => true,
            (Processing, Processing | Completed | Failed) => true,
            (Queued, Queued | Completed | Failed) => false,
            (Processing, Queued) => false,
            (Completed | Failed, _) => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Queued => "Queued",
            TaskStatus::Processing => "Processing",
            TaskStatus::Completed => "Completed",
            TaskStatus::Failed => "Failed",
        };
        f.write_str(label)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parameters snapshot handed to the analysis engine.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskParams {
    pub trial_count: u32,
    pub top_k: u32,
    pub reverse_complement_mode: bool,
    pub min_hamming_distance_mode: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub owner: String,
    pub filename: String,
    pub file_path: String,
    pub params: TaskParams,
    pub status: TaskStatus,
    pub submit_time: DateTime<Utc>,
    pub complete_time: Option<DateTime<Utc>>,
    pub result: Option<ResultMap>,
    pub error_detail: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
}

/// Fields written together with a status change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub result: Option<ResultMap>,
    pub error_detail: Option<String>,
    pub complete_time: Option<DateTime<Utc>>,
}

impl TaskPatch {
    pub fn completed(result: ResultMap, at: DateTime<Utc>) -> Self {
        Self {
            result: Some(result),
            error_detail: None,
            complete_time: Some(at),
        }
    }

    pub fn failed(detail: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            result: None,
            error_detail: Some(detail.into()),
            complete_time: Some(at),
        }
    }
}

impl Task {
    pub fn new(
        owner: &str,
        filename: &str,
        file_path: &str,
        params: TaskParams,
        submit_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TaskId::generate(),
            owner: owner.to_string(),
            filename: filename.to_string(),
            file_path: file_path.to_string(),
            params,
            status: TaskStatus::Queued,
            submit_time,
            complete_time: None,
            result: None,
            error_detail: None,
            attempts: 0,
            lease_expires_at: None,
        }
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        match self.lease_expires_at {
            Some(deadline) => deadline <= now,
            None => false,
        }
    }

    /// Moves the task to `to`, applying `patch`. The record is left untouched
    /// when the edge or the patch would break the lifecycle invariants.
    pub fn advance(&mut self, to: TaskStatus, patch: TaskPatch) -> Result<(), TaskError> {
        let from = self.status;
        if !from.can_advance_to(to) {
            return Err(TaskError::InvalidTransition { from, to });
        }

        match to {
            TaskStatus::Completed => {
                let result = patch
                    .result
                    .ok_or(TaskError::InvalidTransition { from, to })?;
                self.result = Some(result);
                self.error_detail = None;
            }
            TaskStatus::Failed => {
                let detail = patch
                    .error_detail
                    .ok_or(TaskError::InvalidTransition { from, to })?;
                self.result = None;
                self.error_detail = Some(detail);
            }
            TaskStatus::Queued | TaskStatus::Processing => {
                self.result = None;
                self.error_detail = None;
            }
        }

        if to.is_terminal() {
            self.complete_time = Some(patch.complete_time.unwrap_or_else(Utc::now));
            self.lease_expires_at = None;
        } else {
            self.complete_time = None;
        }
        self.status = to;
        Ok(())
    }
}
