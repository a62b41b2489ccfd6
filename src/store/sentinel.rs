use std::time::Duration;

use async_trait::async_trait;

use crate::errors::StoreError;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

#[async_trait]
pub trait PrimaryResolver: Send + Sync {
    async fn resolve_primary(&self) -> Result<String, StoreError>;
}

pub struct StaticResolver {
    url: String,
}

impl StaticResolver {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl PrimaryResolver for StaticResolver {
    async fn resolve_primary(&self) -> Result<String, StoreError> {
        Ok(self.url.clone())
    }
}

/// Tries each sentinel in turn until one names the primary.
pub struct SentinelResolver {
    sentinels: Vec<(String, redis::Client)>,
    master_name: String,
    password: Option<String>,
    db: i64,
}

impl SentinelResolver {
    pub fn new(
        sentinel_urls: &[String],
        master_name: impl Into<String>,
        password: Option<String>,
        db: i64,
    ) -> Result<Self, StoreError> {
        let sentinels = sentinel_urls
            .iter()
            .map(|url| {
                redis::Client::open(url.as_str())
                    .map(|client| (url.clone(), client))
                    .map_err(|e| StoreError::Lookup(format!("invalid sentinel url {}: {}", url, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            sentinels,
            master_name: master_name.into(),
            password,
            db,
        })
    }

    async fn ask(&self, client: &redis::Client) -> Result<Option<(String, u16)>, redis::RedisError> {
        let mut conn = client.get_async_connection().await?;
        redis::cmd("SENTINEL")
            .arg("get-master-addr-by-name")
            .arg(&self.master_name)
            .query_async(&mut conn)
            .await
    }
}

#[async_trait]
impl PrimaryResolver for SentinelResolver {
    async fn resolve_primary(&self) -> Result<String, StoreError> {
        for (url, client) in &self.sentinels {
            match tokio::time::timeout(LOOKUP_TIMEOUT, self.ask(client)).await {
                Ok(Ok(Some((host, port)))) => {
                    tracing::debug!("Sentinel {} reports primary {}:{}", url, host, port);
                    return Ok(primary_url(&host, port, self.password.as_deref(), self.db));
                }
                Ok(Ok(None)) => {
                    tracing::warn!("Sentinel {} does not know master {}", url, self.master_name);
                }
                Ok(Err(e)) => tracing::warn!("Sentinel {} lookup failed: {}", url, e),
                Err(_) => tracing::warn!("Sentinel {} lookup timed out", url),
            }
        }

        Err(StoreError::Lookup(format!(
            "no sentinel returned a primary for {}",
            self.master_name
        )))
    }
}

fn primary_url(host: &str, port: u16, password: Option<&str>, db: i64) -> String {
    let host = if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };
    match password {
        Some(password) => format!("redis://:{}@{}:{}/{}", password, host, port, db),
        None => format!("redis://{}:{}/{}", host, port, db),
    }
}
