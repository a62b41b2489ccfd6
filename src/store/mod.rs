mod failover;
mod memory;
mod redis_store;
mod sentinel;

pub use failover::{Connector, FailoverRouter, RetryPolicy};
pub use memory::MemoryStore;
pub use redis_store::{RedisConnector, RedisStore};
pub use sentinel::{PrimaryResolver, SentinelResolver, StaticResolver};

use async_trait::async_trait;
use crate::errors::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub version: u64,
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Created,
    // Same document already stored by an earlier try
    Replayed,
    Collision,
    IndexFull { count: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOutcome {
    Applied,
    Conflict,
    Missing,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// With `limit`, refuses when the owner's index already holds that many ids.
    async fn insert_task(
        &self,
        owner: &str,
        id: &str,
        score: i64,
        data: &str,
        limit: Option<usize>,
    ) -> Result<InsertOutcome, StoreError>;

    async fn load_task(&self, id: &str) -> Result<Option<Versioned>, StoreError>;

    async fn swap_task(&self, id: &str, expected: u64, data: &str) -> Result<SwapOutcome, StoreError>;

    async fn remove_task(&self, owner: &str, id: &str) -> Result<bool, StoreError>;

    async fn task_ids(&self, owner: &str) -> Result<Vec<String>, StoreError>;

    async fn task_count(&self, owner: &str) -> Result<usize, StoreError>;

    async fn owners(&self) -> Result<Vec<String>, StoreError>;

    /// Charges `seconds` of processing time for task `id`. Charging the same
    /// task again overwrites its entry.
    async fn record_usage(&self, owner: &str, id: &str, seconds: u64) -> Result<(), StoreError>;

    async fn usage(&self, owner: &str) -> Result<u64, StoreError>;
}

pub(crate) fn task_key(id: &str) -> String {
    format!("task:{}", id)
}

pub(crate) fn index_key(owner: &str) -> String {
    format!("user:{}:tasks", owner)
}

pub(crate) fn usage_key(owner: &str) -> String {
    format!("user:{}:usage", owner)
}

pub(crate) const INDEX_PATTERN: &str = "user:*:tasks";

pub(crate) fn owner_from_index_key(key: &str) -> Option<&str> {
    key.strip_prefix("user:")?.strip_suffix(":tasks")
}
