use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::errors::{StoreError, TaskError};
use crate::models::{Task, TaskId, TaskParams, TaskPatch, TaskStatus};
use crate::store::{InsertOutcome, RecordStore, SwapOutcome};

// Version conflicts tolerated before an update gives up
const CAS_ROUNDS: usize = 8;

// analysis_timeout_secs + lease_grace_secs from config/default.toml
const DEFAULT_LEASE: Duration = Duration::from_secs(3600 + 120);

pub struct TaskRegistry {
    store: Arc<dyn RecordStore>,
    slot_limit: Option<usize>,
    lease: Duration,
}

impl TaskRegistry {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            slot_limit: None,
            lease: DEFAULT_LEASE,
        }
    }

    /// Makes `create` reserve the owner's slot inside the insert itself.
    pub fn with_slot_limit(mut self, limit: usize) -> Self {
        self.slot_limit = Some(limit);
        self
    }

    /// Lease stamped when `transition` moves a task into `Processing`.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub async fn create(
        &self,
        owner: &str,
        filename: &str,
        file_path: &str,
        params: TaskParams,
    ) -> Result<Task, TaskError> {
        let task = Task::new(owner, filename, file_path, params, Utc::now());
        let data = encode(&task)?;
        let score = task.submit_time.timestamp_micros();

        let outcome = self
            .store
            .insert_task(owner, task.id.as_str(), score, &data, self.slot_limit)
            .await?;

        match outcome {
            InsertOutcome::Created | InsertOutcome::Replayed => {
                tracing::info!("Created task {} for user {}", task.id, owner);
                Ok(task)
            }
            InsertOutcome::Collision => Err(TaskError::Duplicate(task.id.to_string())),
            InsertOutcome::IndexFull { count } => Err(TaskError::QuotaExceeded {
                current: count,
                max: self.slot_limit.unwrap_or(count),
            }),
        }
    }

    pub async fn get(&self, id: &TaskId) -> Result<Task, TaskError> {
        self.load(id).await.map(|(_, task)| task)
    }

    async fn load(&self, id: &TaskId) -> Result<(u64, Task), TaskError> {
        let record = self
            .store
            .load_task(id.as_str())
            .await?
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        Ok((record.version, decode(id, &record.data)?))
    }

    async fn update<P, M>(&self, id: &TaskId, precondition: P, mutate: M) -> Result<Task, TaskError>
    where
        P: Fn(&Task) -> bool,
        M: Fn(&mut Task) -> Result<(), TaskError>,
    {
        for _ in 0..CAS_ROUNDS {
            let (version, current) = self.load(id).await?;
            if !precondition(&current) {
                return Err(TaskError::StaleTransition(id.to_string()));
            }

            let mut next = current;
            mutate(&mut next)?;

            match self.store.swap_task(id.as_str(), version, &encode(&next)?).await? {
                SwapOutcome::Applied => return Ok(next),
                SwapOutcome::Missing => return Err(TaskError::NotFound(id.to_string())),
                SwapOutcome::Conflict => {
                    tracing::debug!("Task {} changed under us at version {}, re-reading", id, version);
                }
            }
        }
        Err(TaskError::StaleTransition(id.to_string()))
    }

    /// Moves the task from `from` to `to` only if it is still in `from`.
    pub async fn transition(
        &self,
        id: &TaskId,
        from: TaskStatus,
        to: TaskStatus,
        patch: TaskPatch,
    ) -> Result<Task, TaskError> {
        // Entering Processing starts an attempt the same way `claim` does.
        let deadline = match to {
            TaskStatus::Processing => Some(lease_deadline(Utc::now(), self.lease)?),
            _ => None,
        };

        let task = self
            .update(
                id,
                |task| task.status == from,
                |task| {
                    task.advance(to, patch.clone())?;
                    if let Some(deadline) = deadline {
                        start_attempt(task, deadline);
                    }
                    Ok(())
                },
            )
            .await?;
        tracing::debug!("Task {} moved from {} to {}", id, from, to);

        self.charge(&task).await;
        Ok(task)
    }

    /// Takes a `Queued` task, or a `Processing` one whose lease ran out, for
    /// one more attempt.
    pub async fn claim(&self, id: &TaskId, now: DateTime<Utc>, lease: Duration) -> Result<Task, TaskError> {
        let deadline = lease_deadline(now, lease)?;
        let task = self
            .update(
                id,
                |task| match task.status {
                    TaskStatus::Queued => true,
                    TaskStatus::Processing => task.lease_expired(now),
                    TaskStatus::Completed | TaskStatus::Failed => false,
                },
                |task| {
                    task.advance(TaskStatus::Processing, TaskPatch::default())?;
                    start_attempt(task, deadline);
                    Ok(())
                },
            )
            .await?;

        if task.attempts > 1 {
            tracing::warn!("Reclaimed task {} for attempt {}", id, task.attempts);
        }
        Ok(task)
    }

    /// Refused when the task was reclaimed by a later attempt meanwhile.
    pub async fn settle(&self, claimed: &Task, to: TaskStatus, patch: TaskPatch) -> Result<Task, TaskError> {
        let attempt = claimed.attempts;
        let task = self
            .update(
                &claimed.id,
                |task| task.status == TaskStatus::Processing && task.attempts == attempt,
                |task| task.advance(to, patch.clone()),
            )
            .await?;

        self.charge(&task).await;
        Ok(task)
    }

    // Bills the owner for a finished task, from submission to completion.
    // The status is already written, so a failure here is only logged.
    async fn charge(&self, task: &Task) {
        let Some(done) = task.complete_time else {
            return;
        };
        let seconds = (done - task.submit_time).num_seconds().max(0) as u64;

        if let Err(e) = self.store.record_usage(&task.owner, task.id.as_str(), seconds).await {
            tracing::error!(
                "Failed to charge {} seconds to user {} for task {}: {}",
                seconds,
                task.owner,
                task.id,
                e
            );
        }
    }

    pub async fn used_seconds(&self, owner: &str) -> Result<u64, TaskError> {
        Ok(self.store.usage(owner).await?)
    }

    /// The owner's tasks in submission order. Ids whose record vanished
    /// (deleted concurrently) are skipped.
    pub async fn list_for_user(&self, owner: &str) -> Result<Vec<Task>, TaskError> {
        let ids = self.store.task_ids(owner).await?;

        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(&TaskId::from(id)).await {
                Ok(task) => tasks.push(task),
                Err(TaskError::NotFound(id)) => {
                    tracing::warn!("Task {} listed for user {} has no record", id, owner)
                }
                Err(e) => return Err(e),
            }
        }

        tasks.sort_by(|a, b| a.submit_time.cmp(&b.submit_time).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    pub async fn count_for_user(&self, owner: &str) -> Result<usize, TaskError> {
        Ok(self.store.task_count(owner).await?)
    }

    pub async fn delete(&self, id: &TaskId, owner: &str) -> Result<Task, TaskError> {
        let task = self.get(id).await?;
        if task.owner != owner {
            return Err(TaskError::Forbidden(id.to_string()));
        }

        self.store.remove_task(owner, id.as_str()).await?;
        tracing::info!("Deleted task {} ({}) for user {}", id, task.status, owner);
        Ok(task)
    }

    pub async fn owners(&self) -> Result<Vec<String>, TaskError> {
        Ok(self.store.owners().await?)
    }
}

fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> Result<DateTime<Utc>, TaskError> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_add_signed(lease))
        .ok_or(TaskError::LeaseOutOfRange(lease))
}

fn start_attempt(task: &mut Task, deadline: DateTime<Utc>) {
    task.attempts += 1;
    task.lease_expires_at = Some(deadline);
}

fn encode(task: &Task) -> Result<String, TaskError> {
    serde_json::to_string(task).map_err(|e| {
        TaskError::Store(StoreError::Corrupt {
            key: task.id.to_string(),
            reason: e.to_string(),
        })
    })
}

fn decode(id: &TaskId, data: &str) -> Result<Task, TaskError> {
    serde_json::from_str(data).map_err(|e| {
        TaskError::Store(StoreError::Corrupt {
            key: id.to_string(),
            reason: e.to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::models::ResultMap;
    use crate::store::{Connector, FailoverRouter, MemoryStore, RetryPolicy, StaticResolver, Versioned};

    fn registry() -> (Arc<MemoryStore>, TaskRegistry) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), TaskRegistry::new(store))
    }

    fn params() -> TaskParams {
        TaskParams {
            trial_count: 10,
            top_k: 5,
            reverse_complement_mode: true,
            min_hamming_distance_mode: false,
        }
    }

    fn assert_invariants(task: &Task) {
        assert_eq!(task.complete_time.is_some(), task.status.is_terminal());
        assert_eq!(task.result.is_some(), task.status == TaskStatus::Completed);
        assert_eq!(task.error_detail.is_some(), task.status == TaskStatus::Failed);
        assert_eq!(task.lease_expires_at.is_some(), task.status == TaskStatus::Processing);
    }

    const LEASE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn create_persists_queued_task_and_indexes_it() {
        let (store, registry) = registry();

        let task = registry.create("alice", "a.fasta", "temp/alice/a.fasta", params()).await.unwrap();

        let stored = registry.get(&task.id).await.unwrap();
        assert_eq!(stored, task);
        assert_eq!(stored.status, TaskStatus::Queued);
        assert_eq!(stored.params, params());
        assert_invariants(&stored);
        assert_eq!(store.task_ids("alice").await.unwrap(), vec![task.id.to_string()]);
    }

    #[tokio::test]
    async fn get_unknown_task_is_not_found() {
        let (_, registry) = registry();

        let err = registry.get(&TaskId::from("missing")).await.unwrap_err();

        assert!(matches!(err, TaskError::NotFound(_)));
    }

    #[tokio::test]
    async fn stale_transition_leaves_record_untouched() {
        let (store, registry) = registry();
        let task = registry.create("alice", "a.fasta", "p", params()).await.unwrap();
        let before = store.load_task(task.id.as_str()).await.unwrap();

        let err = registry
            .transition(
                &task.id,
                TaskStatus::Processing,
                TaskStatus::Completed,
                TaskPatch::completed(ResultMap::new(), Utc::now()),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TaskError::StaleTransition(_)));
        assert_eq!(store.load_task(task.id.as_str()).await.unwrap(), before);
    }

    #[tokio::test]
    async fn lifecycle_keeps_invariants_at_every_step() {
        let (_, registry) = registry();
        let task = registry.create("alice", "a.fasta", "p", params()).await.unwrap();
        assert_invariants(&task);

        let claimed = registry.claim(&task.id, Utc::now(), LEASE).await.unwrap();
        assert_eq!(claimed.status, TaskStatus::Processing);
        assert_eq!(claimed.attempts, 1);
        assert_invariants(&claimed);

        let result = ResultMap::from([("ACGT".to_string(), 12), ("TTAA".to_string(), 7)]);
        let done = registry
            .settle(&claimed, TaskStatus::Completed, TaskPatch::completed(result.clone(), Utc::now()))
            .await
            .unwrap();
        assert_eq!(done.result, Some(result));
        assert_invariants(&done);

        // Terminal tasks never move again.
        let err = registry
            .transition(&task.id, TaskStatus::Completed, TaskStatus::Processing, TaskPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { .. }));
        let err = registry.claim(&task.id, Utc::now(), LEASE).await.unwrap_err();
        assert!(matches!(err, TaskError::StaleTransition(_)));
        assert_eq!(registry.get(&task.id).await.unwrap(), done);
    }

    #[tokio::test]
    async fn only_one_concurrent_claim_wins() {
        let (_, registry) = registry();
        let registry = Arc::new(registry);
        let task = registry.create("alice", "a.fasta", "p", params()).await.unwrap();

        let start = Utc::now();
        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            let id = task.id.clone();
            let now = start + chrono::Duration::milliseconds(i);
            handles.push(tokio::spawn(async move { registry.claim(&id, now, LEASE).await }));
        }

        let mut wins = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(e) => assert!(matches!(e, TaskError::StaleTransition(_)), "{e}"),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(registry.get(&task.id).await.unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn expired_lease_can_be_reclaimed_and_old_attempt_is_fenced() {
        let (_, registry) = registry();
        let task = registry.create("alice", "a.fasta", "p", params()).await.unwrap();
        let start = Utc::now();

        let first = registry.claim(&task.id, start, LEASE).await.unwrap();
        let err = registry.claim(&task.id, start + chrono::Duration::seconds(30), LEASE).await.unwrap_err();
        assert!(matches!(err, TaskError::StaleTransition(_)));

        let second = registry
            .claim(&task.id, start + chrono::Duration::seconds(61), LEASE)
            .await
            .unwrap();
        assert_eq!(second.attempts, 2);

        let err = registry
            .settle(&first, TaskStatus::Failed, TaskPatch::failed("late", Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::StaleTransition(_)));

        registry
            .settle(&second, TaskStatus::Failed, TaskPatch::failed("malformed fasta", Utc::now()))
            .await
            .unwrap();
        let stored = registry.get(&task.id).await.unwrap();
        assert_eq!(stored.error_detail.as_deref(), Some("malformed fasta"));
        assert_invariants(&stored);
    }

    #[tokio::test]
    async fn list_returns_submission_order() {
        let (_, registry) = registry();
        let mut expected = Vec::new();
        for name in ["one.fasta", "two.fasta", "three.fasta"] {
            let task = registry.create("alice", name, "p", params()).await.unwrap();
            expected.push(task.id);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        registry.create("bob", "other.fasta", "p", params()).await.unwrap();

        let ids: Vec<TaskId> = registry
            .list_for_user("alice")
            .await
            .unwrap()
            .into_iter()
            .map(|task| task.id)
            .collect();

        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn delete_checks_owner_and_shrinks_index() {
        let (_, registry) = registry();
        let task = registry.create("alice", "a.fasta", "p", params()).await.unwrap();

        let err = registry.delete(&task.id, "mallory").await.unwrap_err();
        assert!(matches!(err, TaskError::Forbidden(_)));
        assert_eq!(registry.count_for_user("alice").await.unwrap(), 1);

        registry.delete(&task.id, "alice").await.unwrap();
        assert_eq!(registry.count_for_user("alice").await.unwrap(), 0);
        assert!(matches!(
            registry.delete(&task.id, "alice").await.unwrap_err(),
            TaskError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn settle_after_delete_reports_not_found() {
        let (_, registry) = registry();
        let task = registry.create("alice", "a.fasta", "p", params()).await.unwrap();
        let claimed = registry.claim(&task.id, Utc::now(), LEASE).await.unwrap();

        registry.delete(&task.id, "alice").await.unwrap();
        let err = registry
            .settle(&claimed, TaskStatus::Completed, TaskPatch::completed(ResultMap::new(), Utc::now()))
            .await
            .unwrap_err();

        assert!(err.is_benign_race());
        assert!(registry.list_for_user("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn slot_limit_refuses_creation_atomically() {
        let store = Arc::new(MemoryStore::new());
        let registry = TaskRegistry::new(store).with_slot_limit(2);
        registry.create("alice", "a.fasta", "p", params()).await.unwrap();
        registry.create("alice", "b.fasta", "p", params()).await.unwrap();

        let err = registry.create("alice", "c.fasta", "p", params()).await.unwrap_err();

        assert!(matches!(err, TaskError::QuotaExceeded { current: 2, max: 2 }));
        assert_eq!(registry.count_for_user("alice").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn transition_into_processing_starts_a_leased_attempt() {
        let store = Arc::new(MemoryStore::new());
        let registry = TaskRegistry::new(store).with_lease(LEASE);
        let task = registry.create("alice", "a.fasta", "p", params()).await.unwrap();

        let started = registry
            .transition(&task.id, TaskStatus::Queued, TaskStatus::Processing, TaskPatch::default())
            .await
            .unwrap();

        assert_eq!(started.attempts, 1);
        assert_invariants(&started);
        assert_eq!(registry.get(&task.id).await.unwrap(), started);

        // A worker that dies after this transition does not strand the task.
        let later = Utc::now() + chrono::Duration::seconds(61);
        assert!(started.lease_expired(later));
        let reclaimed = registry.claim(&task.id, later, LEASE).await.unwrap();
        assert_eq!(reclaimed.attempts, 2);
        assert_invariants(&reclaimed);
    }

    #[tokio::test]
    async fn unrepresentable_lease_is_refused_without_writing() {
        let (store, registry) = registry();
        let task = registry.create("alice", "a.fasta", "p", params()).await.unwrap();
        let before = store.load_task(task.id.as_str()).await.unwrap();

        let err = registry.claim(&task.id, Utc::now(), Duration::MAX).await.unwrap_err();

        assert!(matches!(err, TaskError::LeaseOutOfRange(_)));
        assert_eq!(store.load_task(task.id.as_str()).await.unwrap(), before);
    }

    #[tokio::test]
    async fn finished_tasks_are_charged_from_submission_to_completion() {
        let (_, registry) = registry();
        let task = registry.create("alice", "a.fasta", "p", params()).await.unwrap();
        let claimed = registry.claim(&task.id, Utc::now(), LEASE).await.unwrap();

        let done_at = task.submit_time + chrono::Duration::seconds(90);
        registry
            .settle(&claimed, TaskStatus::Completed, TaskPatch::completed(ResultMap::new(), done_at))
            .await
            .unwrap();

        assert_eq!(registry.used_seconds("alice").await.unwrap(), 90);
        // Deleting the task does not refund the time.
        registry.delete(&task.id, "alice").await.unwrap();
        assert_eq!(registry.used_seconds("alice").await.unwrap(), 90);
        assert_eq!(registry.used_seconds("bob").await.unwrap(), 0);
    }

    struct LocalConnector(Arc<MemoryStore>);

    #[async_trait]
    impl Connector for LocalConnector {
        type Conn = Arc<MemoryStore>;

        async fn connect(&self, _addr: &str) -> Result<Arc<MemoryStore>, StoreError> {
            Ok(self.0.clone())
        }
    }

    // Writes go through a FailoverRouter. When armed, the next write is
    // applied and its reply then lost, as if the primary died mid-command.
    struct ReplyLosingStore {
        inner: Arc<MemoryStore>,
        router: FailoverRouter<LocalConnector>,
        lose_next_reply: AtomicBool,
    }

    impl ReplyLosingStore {
        fn new(inner: Arc<MemoryStore>) -> Self {
            let router = FailoverRouter::new(
                Arc::new(StaticResolver::new("redis://node-a")),
                LocalConnector(inner.clone()),
                RetryPolicy { attempts: 3, backoff: Duration::from_millis(1) },
            );
            Self { inner, router, lose_next_reply: AtomicBool::new(false) }
        }

        fn arm(&self) {
            self.lose_next_reply.store(true, Ordering::SeqCst);
        }

        fn reply<T>(&self, result: Result<T, StoreError>) -> Result<T, StoreError> {
            if result.is_ok() && self.lose_next_reply.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Connection {
                    addr: "redis://node-a".into(),
                    reason: "connection reset".into(),
                });
            }
            result
        }
    }

    #[async_trait]
    impl RecordStore for ReplyLosingStore {
        async fn insert_task(
            &self,
            owner: &str,
            id: &str,
            score: i64,
            data: &str,
            limit: Option<usize>,
        ) -> Result<InsertOutcome, StoreError> {
            self.router
                .run("insert_task", |store| async move {
                    self.reply(store.insert_task(owner, id, score, data, limit).await)
                })
                .await
        }

        async fn load_task(&self, id: &str) -> Result<Option<Versioned>, StoreError> {
            self.inner.load_task(id).await
        }

        async fn swap_task(&self, id: &str, expected: u64, data: &str) -> Result<SwapOutcome, StoreError> {
            self.router
                .run("swap_task", |store| async move {
                    self.reply(store.swap_task(id, expected, data).await)
                })
                .await
        }

        async fn remove_task(&self, owner: &str, id: &str) -> Result<bool, StoreError> {
            self.inner.remove_task(owner, id).await
        }

        async fn task_ids(&self, owner: &str) -> Result<Vec<String>, StoreError> {
            self.inner.task_ids(owner).await
        }

        async fn task_count(&self, owner: &str) -> Result<usize, StoreError> {
            self.inner.task_count(owner).await
        }

        async fn owners(&self) -> Result<Vec<String>, StoreError> {
            self.inner.owners().await
        }

        async fn record_usage(&self, owner: &str, id: &str, seconds: u64) -> Result<(), StoreError> {
            self.inner.record_usage(owner, id, seconds).await
        }

        async fn usage(&self, owner: &str) -> Result<u64, StoreError> {
            self.inner.usage(owner).await
        }
    }

    #[tokio::test]
    async fn writes_retried_after_a_lost_reply_are_not_applied_twice() {
        let inner = Arc::new(MemoryStore::new());
        let store = Arc::new(ReplyLosingStore::new(inner.clone()));
        let registry = TaskRegistry::new(store.clone());

        store.arm();
        let task = registry.create("alice", "a.fasta", "p", params()).await.unwrap();
        assert_eq!(inner.task_ids("alice").await.unwrap(), vec![task.id.to_string()]);
        assert_eq!(registry.get(&task.id).await.unwrap(), task);

        let claimed = registry.claim(&task.id, Utc::now(), LEASE).await.unwrap();
        let result = ResultMap::from([("ACGT".to_string(), 12)]);
        store.arm();
        let done = registry
            .settle(&claimed, TaskStatus::Completed, TaskPatch::completed(result, Utc::now()))
            .await
            .unwrap();

        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(registry.get(&task.id).await.unwrap(), done);
        // Insert, claim, settle: one version bump each, none doubled.
        assert_eq!(inner.load_task(task.id.as_str()).await.unwrap().unwrap().version, 3);
        assert_eq!(inner.task_count("alice").await.unwrap(), 1);
    }
}
