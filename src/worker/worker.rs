use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::dispatcher::JobQueue;
use crate::analysis::Analyzer;
use crate::config::{UserConfig, WorkerConfig};
use crate::errors::{TaskError, WorkerError, WorkerResult};
use crate::models::{ResultMap, Task, TaskId, TaskPatch, TaskStatus};
use crate::services::{FileStore, TaskRegistry};

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub analysis_timeout: Duration,
    pub lease: Duration,
    pub time_quota: Duration,
}

impl WorkerSettings {
    pub fn from_config(worker: &WorkerConfig, user: &UserConfig) -> Self {
        Self {
            analysis_timeout: worker.analysis_timeout(),
            lease: worker.lease(),
            time_quota: user.time_quota(),
        }
    }
}

pub struct WorkerContext {
    pub registry: Arc<TaskRegistry>,
    pub analyzer: Arc<dyn Analyzer>,
    pub files: Arc<FileStore>,
    /// Bounds how many analyses run at once across the pool.
    pub permits: Arc<Semaphore>,
    pub settings: WorkerSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Not claimable: already taken, finished or deleted.
    Skipped,
    Completed,
    Failed,
    /// The outcome could not be recorded (task deleted, reclaimed, or the
    /// store refused the write).
    Lost,
}

pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(n: usize, queue: Arc<JobQueue>, ctx: Arc<WorkerContext>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let queue = Arc::clone(&queue);
            let ctx = Arc::clone(&ctx);
            let rx = shutdown_rx.clone();

            let span = tracing::info_span!("worker", worker_id);
            joins.push(tokio::spawn(worker_loop(queue, ctx, rx).instrument(span)));
        }

        Self { shutdown_tx, joins }
    }

    /// Receiver that flips to `true` when the pool starts shutting down.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Stops taking new jobs, lets the workers drain what is already queued
    /// and waits for them to exit.
    pub async fn shutdown_and_join(self) {
        let _ = self.shutdown_tx.send(true);
        for join in self.joins {
            if let Err(e) = join.await {
                tracing::error!("Worker exited abnormally: {}", e);
            }
        }
        tracing::info!("All workers stopped");
    }
}

async fn worker_loop(queue: Arc<JobQueue>, ctx: Arc<WorkerContext>, mut shutdown_rx: watch::Receiver<bool>) {
    tracing::info!("Worker started");

    while let Some(id) = queue.next(&mut shutdown_rx).await {
        let outcome = process_job(&ctx, id.clone()).await;
        tracing::debug!("Job {} finished as {:?}", id, outcome);
    }

    tracing::info!("Worker stopped");
}

/// Claims the task, runs the analysis and records the outcome.
pub async fn process_job(ctx: &WorkerContext, id: TaskId) -> JobOutcome {
    let _permit = match ctx.permits.acquire().await {
        Ok(permit) => permit,
        Err(e) => {
            tracing::error!("Failed to acquire analysis permit: {}", e);
            return JobOutcome::Skipped;
        }
    };

    let task = match ctx.registry.claim(&id, Utc::now(), ctx.settings.lease).await {
        Ok(task) => task,
        Err(e) if e.is_benign_race() => {
            tracing::debug!("Skipping task {}: {}", id, e);
            return JobOutcome::Skipped;
        }
        Err(e) => {
            tracing::error!("Failed to claim task {}: {}", id, e);
            return JobOutcome::Skipped;
        }
    };

    tracing::info!(
        "Processing task {} for user {} (attempt {})",
        task.id,
        task.owner,
        task.attempts
    );
    let result = match analysis_budget(ctx, &task).await {
        Some(timeout) => run_analysis(ctx, &task, timeout).await,
        None => Err(WorkerError::QuotaExhausted),
    };
    record_outcome(ctx, &task, result).await
}

// The configured timeout, cut down to what is left of the owner's processing
// time. None once nothing is left.
async fn analysis_budget(ctx: &WorkerContext, task: &Task) -> Option<Duration> {
    let limit = ctx.settings.analysis_timeout;
    let used = match ctx.registry.used_seconds(&task.owner).await {
        Ok(used) => used,
        Err(e) => {
            tracing::warn!("Could not read processing time of user {}: {}", task.owner, e);
            return Some(limit);
        }
    };

    let remaining = ctx.settings.time_quota.saturating_sub(Duration::from_secs(used));
    if remaining.is_zero() {
        tracing::warn!("User {} has used all {} seconds of processing time", task.owner, used);
        return None;
    }
    Some(limit.min(remaining))
}

async fn run_analysis(ctx: &WorkerContext, task: &Task, timeout: Duration) -> WorkerResult<ResultMap> {
    let analyzer = Arc::clone(&ctx.analyzer);
    let path = PathBuf::from(&task.file_path);
    let params = task.params.clone();

    tracing::debug!("Starting analysis with timeout of {} seconds", timeout.as_secs());

    // Spawned so a panic in the analyzer surfaces as a JoinError.
    let mut handle = tokio::spawn(async move { analyzer.analyze(&path, &params).await });

    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(result)) => result.map_err(WorkerError::from),
        Ok(Err(e)) => {
            tracing::error!("Analysis of task {} panicked: {}", task.id, e);
            Err(WorkerError::TaskPanic(e.to_string()))
        }
        Err(_) => {
            handle.abort();
            tracing::error!("Analysis of task {} timed out after {} seconds", task.id, timeout.as_secs());
            Err(WorkerError::Timeout(timeout.as_secs()))
        }
    }
}

async fn record_outcome(ctx: &WorkerContext, task: &Task, result: WorkerResult<ResultMap>) -> JobOutcome {
    let (to, patch) = match result {
        Ok(result) => (TaskStatus::Completed, TaskPatch::completed(result, Utc::now())),
        Err(e) => {
            tracing::warn!("Task {} failed: {}", task.id, e);
            (TaskStatus::Failed, TaskPatch::failed(e.to_string(), Utc::now()))
        }
    };

    match ctx.registry.settle(task, to, patch).await {
        Ok(_) => {
            tracing::info!("Task {} {}", task.id, to);
            ctx.files.discard(&task.file_path).await;
            match to {
                TaskStatus::Completed => JobOutcome::Completed,
                _ => JobOutcome::Failed,
            }
        }
        Err(TaskError::NotFound(_)) => {
            tracing::info!("Task {} was deleted while running, dropping its outcome", task.id);
            ctx.files.discard(&task.file_path).await;
            JobOutcome::Lost
        }
        Err(TaskError::StaleTransition(_)) => {
            // Reclaimed by a later attempt, which still needs the input file.
            tracing::warn!("Task {} attempt {} was superseded", task.id, task.attempts);
            JobOutcome::Lost
        }
        Err(e) => {
            tracing::error!("Failed to record outcome of task {}: {}", task.id, e);
            JobOutcome::Lost
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use tempfile::TempDir;

    use crate::analysis::AnalysisError;
    use crate::models::TaskParams;
    use crate::store::MemoryStore;
    use crate::worker::job_queue;

    enum Behavior {
        Succeed(ResultMap),
        Reject(&'static str),
        Hang,
        Panic,
    }

    struct StubAnalyzer(Behavior);

    #[async_trait]
    impl Analyzer for StubAnalyzer {
        async fn analyze(&self, file_path: &Path, _params: &TaskParams) -> Result<ResultMap, AnalysisError> {
            assert!(file_path.exists(), "input file should exist while analysing");
            match &self.0 {
                Behavior::Succeed(result) => Ok(result.clone()),
                Behavior::Reject(reason) => Err(AnalysisError::Rejected(reason.to_string())),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(ResultMap::new())
                }
                Behavior::Panic => panic!("engine blew up"),
            }
        }
    }

    struct Fixture {
        ctx: Arc<WorkerContext>,
        dir: TempDir,
    }

    const SETTINGS: WorkerSettings = WorkerSettings {
        analysis_timeout: Duration::from_millis(100),
        lease: Duration::from_secs(60),
        time_quota: Duration::from_secs(36000),
    };

    fn fixture(behavior: Behavior) -> Fixture {
        fixture_with(behavior, SETTINGS)
    }

    fn fixture_with(behavior: Behavior, settings: WorkerSettings) -> Fixture {
        let dir = TempDir::new().unwrap();
        let ctx = WorkerContext {
            registry: Arc::new(TaskRegistry::new(Arc::new(MemoryStore::new()))),
            analyzer: Arc::new(StubAnalyzer(behavior)),
            files: Arc::new(FileStore::new(dir.path())),
            permits: Arc::new(Semaphore::new(2)),
            settings,
        };
        Fixture { ctx: Arc::new(ctx), dir }
    }

    async fn submit(ctx: &WorkerContext) -> Task {
        let path = ctx.files.store_upload("alice", "a.fasta", b">s\nACGT\n").await.unwrap();
        let params = TaskParams {
            trial_count: 10,
            top_k: 5,
            reverse_complement_mode: true,
            min_hamming_distance_mode: false,
        };
        ctx.registry
            .create("alice", "a.fasta", &path.to_string_lossy(), params)
            .await
            .unwrap()
    }

    fn motifs() -> ResultMap {
        ResultMap::from([("ACGT".to_string(), 12), ("TTAA".to_string(), 7)])
    }

    #[tokio::test]
    async fn successful_analysis_completes_the_task() {
        let f = fixture(Behavior::Succeed(motifs()));
        let task = submit(&f.ctx).await;

        assert_eq!(process_job(&f.ctx, task.id.clone()).await, JobOutcome::Completed);

        let stored = f.ctx.registry.get(&task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.result, Some(motifs()));
        assert!(stored.complete_time.is_some());
        assert!(stored.lease_expires_at.is_none());
        assert!(!Path::new(&stored.file_path).exists());
    }

    #[tokio::test]
    async fn rejected_input_fails_the_task() {
        let f = fixture(Behavior::Reject("malformed fasta"));
        let task = submit(&f.ctx).await;

        assert_eq!(process_job(&f.ctx, task.id.clone()).await, JobOutcome::Failed);

        let stored = f.ctx.registry.get(&task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.error_detail.as_deref(), Some("malformed fasta"));
        assert!(stored.result.is_none());
        assert!(stored.complete_time.is_some());
    }

    #[tokio::test]
    async fn slow_analysis_times_out() {
        let f = fixture(Behavior::Hang);
        let task = submit(&f.ctx).await;

        assert_eq!(process_job(&f.ctx, task.id.clone()).await, JobOutcome::Failed);

        let stored = f.ctx.registry.get(&task.id).await.unwrap();
        let detail = stored.error_detail.unwrap();
        assert!(detail.starts_with("analysis timed out after"), "{detail}");
    }

    #[tokio::test]
    async fn panicking_analyzer_fails_the_task() {
        let f = fixture(Behavior::Panic);
        let task = submit(&f.ctx).await;

        assert_eq!(process_job(&f.ctx, task.id.clone()).await, JobOutcome::Failed);

        let stored = f.ctx.registry.get(&task.id).await.unwrap();
        let detail = stored.error_detail.unwrap();
        assert!(detail.starts_with("analysis panicked"), "{detail}");
    }

    #[tokio::test]
    async fn deleted_task_is_skipped() {
        let f = fixture(Behavior::Succeed(motifs()));
        let task = submit(&f.ctx).await;
        f.ctx.registry.delete(&task.id, "alice").await.unwrap();

        assert_eq!(process_job(&f.ctx, task.id).await, JobOutcome::Skipped);
    }

    #[tokio::test]
    async fn finished_task_is_not_run_twice() {
        let f = fixture(Behavior::Succeed(motifs()));
        let task = submit(&f.ctx).await;
        process_job(&f.ctx, task.id.clone()).await;

        assert_eq!(process_job(&f.ctx, task.id).await, JobOutcome::Skipped);
    }

    #[tokio::test]
    async fn outcome_of_task_deleted_mid_run_is_dropped() {
        let f = fixture(Behavior::Succeed(motifs()));
        let task = submit(&f.ctx).await;
        let claimed = f.ctx.registry.claim(&task.id, Utc::now(), Duration::from_secs(60)).await.unwrap();
        f.ctx.registry.delete(&task.id, "alice").await.unwrap();

        let outcome = record_outcome(&f.ctx, &claimed, Ok(motifs())).await;

        assert_eq!(outcome, JobOutcome::Lost);
        assert!(!Path::new(&claimed.file_path).exists());
        assert!(f.ctx.registry.list_for_user("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn superseded_attempt_keeps_the_input_for_its_successor() {
        let f = fixture(Behavior::Succeed(motifs()));
        let task = submit(&f.ctx).await;
        let start = Utc::now();
        let lease = Duration::from_secs(1);
        let first = f.ctx.registry.claim(&task.id, start, lease).await.unwrap();
        f.ctx
            .registry
            .claim(&task.id, start + chrono::Duration::seconds(2), lease)
            .await
            .unwrap();

        let outcome = record_outcome(&f.ctx, &first, Ok(motifs())).await;

        assert_eq!(outcome, JobOutcome::Lost);
        assert!(Path::new(&first.file_path).exists());
        let stored = f.ctx.registry.get(&task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Processing);
        assert_eq!(stored.attempts, 2);
    }

    #[tokio::test]
    async fn pool_drains_queued_jobs_on_shutdown() {
        let f = fixture(Behavior::Succeed(motifs()));
        let (dispatcher, queue) = job_queue(8);
        let mut ids = Vec::new();
        for _ in 0..3 {
            let task = submit(&f.ctx).await;
            dispatcher.submit_job(task.id.clone()).await.unwrap();
            ids.push(task.id);
        }

        let pool = WorkerPool::spawn(2, Arc::new(queue), f.ctx.clone());
        pool.shutdown_and_join().await;

        for id in ids {
            assert_eq!(f.ctx.registry.get(&id).await.unwrap().status, TaskStatus::Completed);
        }
        assert!(std::fs::read_dir(f.dir.path().join("alice")).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn exhausted_time_quota_fails_the_task_without_running_it() {
        let settings = WorkerSettings { time_quota: Duration::from_secs(60), ..SETTINGS };
        let f = fixture_with(Behavior::Panic, settings);
        let earlier = submit(&f.ctx).await;
        let claimed = f.ctx.registry.claim(&earlier.id, Utc::now(), settings.lease).await.unwrap();
        let done_at = earlier.submit_time + chrono::Duration::seconds(60);
        f.ctx
            .registry
            .settle(&claimed, TaskStatus::Completed, TaskPatch::completed(motifs(), done_at))
            .await
            .unwrap();

        let task = submit(&f.ctx).await;
        assert_eq!(process_job(&f.ctx, task.id.clone()).await, JobOutcome::Failed);

        let stored = f.ctx.registry.get(&task.id).await.unwrap();
        assert_eq!(stored.error_detail.as_deref(), Some("processing time quota exhausted"));
        assert!(!Path::new(&stored.file_path).exists());
    }

    #[tokio::test]
    async fn remaining_time_quota_caps_the_analysis_timeout() {
        let settings = WorkerSettings {
            analysis_timeout: Duration::from_secs(3600),
            time_quota: Duration::from_secs(1),
            ..SETTINGS
        };
        let f = fixture_with(Behavior::Hang, settings);
        let task = submit(&f.ctx).await;

        assert_eq!(process_job(&f.ctx, task.id.clone()).await, JobOutcome::Failed);

        let stored = f.ctx.registry.get(&task.id).await.unwrap();
        assert_eq!(stored.error_detail.as_deref(), Some("analysis timed out after 1 seconds"));
        assert!(f.ctx.registry.used_seconds("alice").await.unwrap() >= 1);
    }
}
