use std::sync::Arc;
use std::time::Duration;

use super::registry::TaskRegistry;
use crate::errors::TaskError;
use crate::models::QuotaUsage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Deny { current: usize, max: usize },
}

/// Per-user cap on the number of stored tasks, finished ones included.
///
/// The count and the following create are separate store operations, so two
/// submissions racing at `max - 1` may both be admitted.
pub struct QuotaGuard {
    registry: Arc<TaskRegistry>,
    max_tasks: usize,
    time_quota: Duration,
}

impl QuotaGuard {
    pub fn new(registry: Arc<TaskRegistry>, max_tasks: usize, time_quota: Duration) -> Self {
        Self { registry, max_tasks, time_quota }
    }

    pub async fn admit(&self, owner: &str) -> Result<Admission, TaskError> {
        let current = self.registry.count_for_user(owner).await?;
        if current >= self.max_tasks {
            tracing::info!("User {} is at quota ({}/{})", owner, current, self.max_tasks);
            return Ok(Admission::Deny { current, max: self.max_tasks });
        }
        Ok(Admission::Allow)
    }

    pub async fn usage(&self, owner: &str) -> Result<QuotaUsage, TaskError> {
        let task_count = self.registry.count_for_user(owner).await?;
        let quota_used = self.registry.used_seconds(owner).await?;
        Ok(QuotaUsage {
            task_count,
            max_tasks: self.max_tasks,
            quota_used,
            quota_total: self.time_quota.as_secs(),
        })
    }
}
