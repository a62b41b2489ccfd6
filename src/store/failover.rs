use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::sentinel::PrimaryResolver;
use crate::errors::StoreError;

#[async_trait]
pub trait Connector: Send + Sync {
    type Conn: Clone + Send + Sync + 'static;

    async fn connect(&self, addr: &str) -> Result<Self::Conn, StoreError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.backoff * attempt
    }
}

#[derive(Clone)]
struct Primary<C> {
    addr: String,
    conn: C,
}

pub struct FailoverRouter<C: Connector> {
    resolver: Arc<dyn PrimaryResolver>,
    connector: C,
    policy: RetryPolicy,
    cached: RwLock<Option<Primary<C::Conn>>>,
}

impl<C: Connector> FailoverRouter<C> {
    pub fn new(resolver: Arc<dyn PrimaryResolver>, connector: C, policy: RetryPolicy) -> Self {
        Self {
            resolver,
            connector,
            policy,
            cached: RwLock::new(None),
        }
    }

    async fn primary(&self) -> Result<Primary<C::Conn>, StoreError> {
        if let Some(primary) = self.cached.read().await.as_ref() {
            return Ok(primary.clone());
        }

        let mut cached = self.cached.write().await;
        // Another caller may have resolved while we waited for the lock.
        if let Some(primary) = cached.as_ref() {
            return Ok(primary.clone());
        }

        let addr = self.resolver.resolve_primary().await?;
        let conn = self.connector.connect(&addr).await?;
        tracing::info!("Using store primary {}", addr);

        let primary = Primary { addr, conn };
        *cached = Some(primary.clone());
        Ok(primary)
    }

    // Only if nobody replaced it already
    async fn invalidate(&self, addr: &str) {
        let mut cached = self.cached.write().await;
        if cached.as_ref().is_some_and(|primary| primary.addr == addr) {
            tracing::warn!("Dropping cached store primary {}", addr);
            *cached = None;
        }
    }

    /// `op` may run more than once, so it must be safe to replay.
    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut(C::Conn) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut last = String::from("no attempt made");

        for attempt in 1..=self.policy.attempts {
            let (addr, result) = match self.primary().await {
                Ok(primary) => (Some(primary.addr), op(primary.conn).await),
                Err(e) => (None, Err(e)),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_failover() => {
                    tracing::warn!(
                        "Store {} failed on attempt {}/{}: {}",
                        op_name,
                        attempt,
                        self.policy.attempts,
                        err
                    );
                    if let Some(addr) = addr {
                        self.invalidate(&addr).await;
                    }
                    last = err.to_string();
                    if attempt < self.policy.attempts {
                        tokio::time::sleep(self.policy.delay(attempt)).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }

        tracing::error!("Store {} gave up after {} attempts", op_name, self.policy.attempts);
        Err(StoreError::Unavailable {
            attempts: self.policy.attempts,
            last,
        })
    }
}
