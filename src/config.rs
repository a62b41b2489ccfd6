use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub worker: WorkerConfig,
    pub upload: UploadConfig,
    pub user: UserConfig,
    pub analyzer: AnalyzerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub sentinel_enabled: bool,
    #[serde(default)]
    pub sentinel_urls: Vec<String>,
    #[serde(default = "default_master_name")]
    pub master_name: String,
    /// Used when connecting to a primary found through sentinel.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: i64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    pub worker_count: usize,
    pub max_concurrent_tasks: usize,
    pub queue_capacity: usize,
    pub analysis_timeout_secs: u64,
    pub lease_grace_secs: u64,
    pub max_attempts: u32,
    pub reaper_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    pub max_file_size: usize,  // bytes
    pub temp_dir: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QuotaMode {
    /// Check the index size, then create. May overshoot by one under races.
    Advisory,
    /// Reserve the slot inside the create operation itself.
    Strict,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UserConfig {
    pub max_tasks_per_user: usize,
    #[serde(default = "default_quota_mode")]
    pub quota_mode: QuotaMode,
    #[serde(default = "default_time_quota_secs")]
    pub time_quota_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalyzerConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_master_name() -> String {
    "mymaster".to_string()
}

fn default_quota_mode() -> QuotaMode {
    QuotaMode::Advisory
}

fn default_time_quota_secs() -> u64 {
    36000  // 10 hours
}

impl WorkerConfig {
    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.analysis_timeout_secs)
    }

    /// How long a claim stays valid. A live worker always settles the task
    /// before this runs out, because the analysis itself is cut off at
    /// `analysis_timeout`.
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.analysis_timeout_secs + self.lease_grace_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}

impl UserConfig {
    /// Processing time each user may spend over the life of their account.
    pub fn time_quota(&self) -> Duration {
        Duration::from_secs(self.time_quota_secs)
    }
}

impl RedisConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("redis.sentinel_urls")
                    .with_list_parse_key("analyzer.args"),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        let invalid = |msg: &str| Err(config::ConfigError::Message(msg.to_string()));

        if self.worker.worker_count == 0 {
            return invalid("worker.worker_count must be at least 1");
        }
        if self.worker.max_concurrent_tasks == 0 {
            return invalid("worker.max_concurrent_tasks must be at least 1");
        }
        if self.worker.queue_capacity == 0 {
            return invalid("worker.queue_capacity must be at least 1");
        }
        if self.worker.max_attempts == 0 {
            return invalid("worker.max_attempts must be at least 1");
        }
        if self.worker.analysis_timeout_secs == 0 || self.worker.reaper_interval_secs == 0 {
            return invalid("worker.analysis_timeout_secs and worker.reaper_interval_secs must be positive");
        }
        if self.redis.retry_attempts == 0 {
            return invalid("redis.retry_attempts must be at least 1");
        }
        if self.redis.sentinel_enabled && self.redis.sentinel_urls.is_empty() {
            return invalid("redis.sentinel_urls is required when sentinel is enabled");
        }
        Ok(())
    }
}
