mod analysis;
mod config;
mod errors;
mod handlers;
mod middleware;
mod models;
mod services;
mod state;
mod store;
mod worker;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Semaphore;

use crate::{
    analysis::{Analyzer, CommandAnalyzer},
    config::{Config, QuotaMode},
    services::{FileStore, QuotaGuard, TaskRegistry, TaskService},
    state::AppState,
    store::{PrimaryResolver, RecordStore, RedisStore, RetryPolicy, SentinelResolver, StaticResolver},
    worker::{job_queue, Reaper, WorkerContext, WorkerPool, WorkerSettings},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::load().context("Failed to load configuration")?;

    // Store client, routed to whichever node sentinel reports as primary
    let resolver: Arc<dyn PrimaryResolver> = if config.redis.sentinel_enabled {
        tracing::info!(
            "Resolving primary {} through {} sentinels",
            config.redis.master_name,
            config.redis.sentinel_urls.len()
        );
        Arc::new(
            SentinelResolver::new(
                &config.redis.sentinel_urls,
                config.redis.master_name.clone(),
                config.redis.password.clone(),
                config.redis.db,
            )
            .context("Failed to configure Redis Sentinel")?,
        )
    } else {
        Arc::new(StaticResolver::new(config.redis.url.clone()))
    };
    let policy = RetryPolicy {
        attempts: config.redis.retry_attempts,
        backoff: config.redis.retry_backoff(),
    };
    let store: Arc<dyn RecordStore> = Arc::new(RedisStore::new(resolver, policy));

    let registry = TaskRegistry::new(store).with_lease(config.worker.lease());
    let registry = match config.user.quota_mode {
        QuotaMode::Advisory => registry,
        QuotaMode::Strict => registry.with_slot_limit(config.user.max_tasks_per_user),
    };
    let registry = Arc::new(registry);
    let files = Arc::new(FileStore::new(&config.upload.temp_dir));
    let (dispatcher, queue) = job_queue(config.worker.queue_capacity);

    // Worker pool with configured values
    let analyzer: Arc<dyn Analyzer> = Arc::new(CommandAnalyzer::from_config(&config.analyzer));
    let ctx = Arc::new(WorkerContext {
        registry: registry.clone(),
        analyzer,
        files: files.clone(),
        permits: Arc::new(Semaphore::new(config.worker.max_concurrent_tasks)),
        settings: WorkerSettings::from_config(&config.worker, &config.user),
    });
    let pool = WorkerPool::spawn(config.worker.worker_count, Arc::new(queue), ctx);

    // A re-queued copy still unclaimed after a full lease is taken as lost.
    let reaper = Reaper::new(
        registry.clone(),
        dispatcher.clone(),
        files.clone(),
        config.worker.max_attempts,
        config.worker.lease(),
    );
    if let Err(e) = reaper.recover_queued().await {
        tracing::error!("Start-up recovery failed, queued tasks wait for the next start: {}", e);
    }
    let reaper = tokio::spawn(reaper.run(config.worker.reaper_interval(), pool.subscribe()));

    let tasks = Arc::new(TaskService::new(
        registry.clone(),
        QuotaGuard::new(registry, config.user.max_tasks_per_user, config.user.time_quota()),
        dispatcher,
        files.clone(),
    ));
    let app = handlers::router(AppState { tasks, files }, config.upload.max_file_size);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Server running on {}", addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server stopped, draining queued jobs");
    pool.shutdown_and_join().await;
    if let Err(e) = reaper.await {
        tracing::error!("Reaper exited abnormally: {}", e);
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
