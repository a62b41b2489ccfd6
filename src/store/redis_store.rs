use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Script;

use super::failover::{Connector, FailoverRouter, RetryPolicy};
use super::sentinel::PrimaryResolver;
use super::{
    index_key, owner_from_index_key, task_key, usage_key, InsertOutcome, RecordStore, SwapOutcome,
    Versioned, INDEX_PATTERN,
};
use crate::errors::StoreError;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

// task:{id} is a hash of `version` and JSON `data`, user:{owner}:tasks a sorted
// set of ids scored by submit time, user:{owner}:usage a hash of seconds per id.

// KEYS: task, index. ARGV: data, id, score, limit (-1 = none).
// Returns {code, count}: 1 created, 2 replayed, 3 collision, 4 index full.
const INSERT_SCRIPT: &str = r"
local existing = redis.call('HGET', KEYS[1], 'data')
if existing then
  if existing == ARGV[1] then return {2, 0} end
  return {3, 0}
end
local limit = tonumber(ARGV[4])
if limit >= 0 then
  local count = redis.call('ZCARD', KEYS[2])
  if count >= limit then return {4, count} end
end
redis.call('HSET', KEYS[1], 'version', 1, 'data', ARGV[1])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[2])
return {1, 0}
";

// KEYS: task. ARGV: expected version, data.
// Returns 1 applied (or already applied by us), 0 conflict, -1 missing.
const SWAP_SCRIPT: &str = r"
local version = redis.call('HGET', KEYS[1], 'version')
if not version then return -1 end
version = tonumber(version)
local expected = tonumber(ARGV[1])
if version == expected then
  redis.call('HSET', KEYS[1], 'version', version + 1, 'data', ARGV[2])
  return 1
end
if version == expected + 1 and redis.call('HGET', KEYS[1], 'data') == ARGV[2] then
  return 1
end
return 0
";

// KEYS: task, index. ARGV: id.
const REMOVE_SCRIPT: &str = r"
local removed = redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[2], ARGV[1])
return removed
";

#[derive(Clone)]
pub struct NodeConnection {
    addr: Arc<str>,
    conn: MultiplexedConnection,
}

impl NodeConnection {
    async fn query<T: redis::FromRedisValue>(&mut self, cmd: &redis::Cmd) -> Result<T, StoreError> {
        let addr = self.addr.clone();
        bounded(&addr, cmd.query_async(&mut self.conn)).await
    }

    async fn invoke<T: redis::FromRedisValue>(
        &mut self,
        invocation: &redis::ScriptInvocation<'_>,
    ) -> Result<T, StoreError> {
        let addr = self.addr.clone();
        bounded(&addr, invocation.invoke_async(&mut self.conn)).await
    }
}

async fn bounded<T>(
    addr: &str,
    fut: impl std::future::Future<Output = redis::RedisResult<T>>,
) -> Result<T, StoreError> {
    match tokio::time::timeout(COMMAND_TIMEOUT, fut).await {
        Ok(result) => result.map_err(|e| StoreError::from_redis(e, addr)),
        Err(_) => Err(StoreError::Connection {
            addr: addr.to_string(),
            reason: "command timed out".into(),
        }),
    }
}

pub struct RedisConnector;

#[async_trait]
impl Connector for RedisConnector {
    type Conn = NodeConnection;

    async fn connect(&self, addr: &str) -> Result<NodeConnection, StoreError> {
        let client = redis::Client::open(addr).map_err(|e| StoreError::from_redis(e, addr))?;
        let conn = bounded(addr, client.get_multiplexed_async_connection()).await?;
        Ok(NodeConnection { addr: Arc::from(addr), conn })
    }
}

pub struct RedisStore {
    router: FailoverRouter<RedisConnector>,
    insert: Script,
    swap: Script,
    remove: Script,
}

impl RedisStore {
    pub fn new(resolver: Arc<dyn PrimaryResolver>, policy: RetryPolicy) -> Self {
        Self {
            router: FailoverRouter::new(resolver, RedisConnector, policy),
            insert: Script::new(INSERT_SCRIPT),
            swap: Script::new(SWAP_SCRIPT),
            remove: Script::new(REMOVE_SCRIPT),
        }
    }
}

#[async_trait]
impl RecordStore for RedisStore {
    async fn insert_task(
        &self,
        owner: &str,
        id: &str,
        score: i64,
        data: &str,
        limit: Option<usize>,
    ) -> Result<InsertOutcome, StoreError> {
        let limit = limit.map_or(-1, |l| l as i64);
        let reply: (i64, i64) = self
            .router
            .run("insert_task", |mut conn| async move {
                let mut invocation = self.insert.prepare_invoke();
                invocation
                    .key(task_key(id))
                    .key(index_key(owner))
                    .arg(data)
                    .arg(id)
                    .arg(score)
                    .arg(limit);
                conn.invoke(&invocation).await
            })
            .await?;
        decode_insert(reply)
    }

    async fn load_task(&self, id: &str) -> Result<Option<Versioned>, StoreError> {
        let key = task_key(id);
        let (version, data): (Option<u64>, Option<String>) = self
            .router
            .run("load_task", |mut conn| {
                let key = key.clone();
                async move {
                    conn.query(redis::cmd("HMGET").arg(&key).arg("version").arg("data"))
                        .await
                }
            })
            .await?;

        match (version, data) {
            (Some(version), Some(data)) => Ok(Some(Versioned { version, data })),
            (None, None) => Ok(None),
            _ => Err(StoreError::Corrupt {
                key,
                reason: "hash is missing version or data".into(),
            }),
        }
    }

    async fn swap_task(&self, id: &str, expected: u64, data: &str) -> Result<SwapOutcome, StoreError> {
        let reply: i64 = self
            .router
            .run("swap_task", |mut conn| async move {
                let mut invocation = self.swap.prepare_invoke();
                invocation.key(task_key(id)).arg(expected).arg(data);
                conn.invoke(&invocation).await
            })
            .await?;
        decode_swap(reply)
    }

    async fn remove_task(&self, owner: &str, id: &str) -> Result<bool, StoreError> {
        let removed: i64 = self
            .router
            .run("remove_task", |mut conn| async move {
                let mut invocation = self.remove.prepare_invoke();
                invocation.key(task_key(id)).key(index_key(owner)).arg(id);
                conn.invoke(&invocation).await
            })
            .await?;
        Ok(removed > 0)
    }

    async fn task_ids(&self, owner: &str) -> Result<Vec<String>, StoreError> {
        self.router
            .run("task_ids", |mut conn| async move {
                conn.query(redis::cmd("ZRANGE").arg(index_key(owner)).arg(0).arg(-1))
                    .await
            })
            .await
    }

    async fn task_count(&self, owner: &str) -> Result<usize, StoreError> {
        self.router
            .run("task_count", |mut conn| async move {
                conn.query(redis::cmd("ZCARD").arg(index_key(owner))).await
            })
            .await
    }

    async fn owners(&self) -> Result<Vec<String>, StoreError> {
        let keys: BTreeSet<String> = self
            .router
            .run("owners", |mut conn| async move {
                let mut keys = BTreeSet::new();
                let mut cursor: u64 = 0;
                loop {
                    let (next, batch): (u64, Vec<String>) = conn
                        .query(
                            redis::cmd("SCAN")
                                .arg(cursor)
                                .arg("MATCH")
                                .arg(INDEX_PATTERN)
                                .arg("COUNT")
                                .arg(200),
                        )
                        .await?;
                    keys.extend(batch);
                    if next == 0 {
                        return Ok(keys);
                    }
                    cursor = next;
                }
            })
            .await?;

        Ok(keys
            .iter()
            .filter_map(|key| owner_from_index_key(key))
            .map(str::to_string)
            .collect())
    }

    async fn record_usage(&self, owner: &str, id: &str, seconds: u64) -> Result<(), StoreError> {
        self.router
            .run("record_usage", |mut conn| async move {
                conn.query::<i64>(redis::cmd("HSET").arg(usage_key(owner)).arg(id).arg(seconds))
                    .await
                    .map(|_| ())
            })
            .await
    }

    async fn usage(&self, owner: &str) -> Result<u64, StoreError> {
        let charged: Vec<u64> = self
            .router
            .run("usage", |mut conn| async move {
                conn.query(redis::cmd("HVALS").arg(usage_key(owner))).await
            })
            .await?;
        Ok(charged.iter().sum())
    }
}

fn decode_insert((code, count): (i64, i64)) -> Result<InsertOutcome, StoreError> {
    match code {
        1 => Ok(InsertOutcome::Created),
        2 => Ok(InsertOutcome::Replayed),
        3 => Ok(InsertOutcome::Collision),
        4 => Ok(InsertOutcome::IndexFull { count: count.max(0) as usize }),
        other => Err(StoreError::Command(format!("unexpected insert reply {}", other))),
    }
}

fn decode_swap(reply: i64) -> Result<SwapOutcome, StoreError> {
    match reply {
        1 => Ok(SwapOutcome::Applied),
        0 => Ok(SwapOutcome::Conflict),
        -1 => Ok(SwapOutcome::Missing),
        other => Err(StoreError::Command(format!("unexpected swap reply {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StaticResolver;

    #[test]
    fn decodes_insert_replies() {
        assert_eq!(decode_insert((1, 0)).unwrap(), InsertOutcome::Created);
        assert_eq!(decode_insert((2, 0)).unwrap(), InsertOutcome::Replayed);
        assert_eq!(decode_insert((3, 0)).unwrap(), InsertOutcome::Collision);
        assert_eq!(decode_insert((4, 5)).unwrap(), InsertOutcome::IndexFull { count: 5 });
        assert!(decode_insert((9, 0)).is_err());
    }

    #[test]
    fn decodes_swap_replies() {
        assert_eq!(decode_swap(1).unwrap(), SwapOutcome::Applied);
        assert_eq!(decode_swap(0).unwrap(), SwapOutcome::Conflict);
        assert_eq!(decode_swap(-1).unwrap(), SwapOutcome::Missing);
        assert!(decode_swap(7).is_err());
    }

    #[tokio::test]
    async fn unreachable_primary_surfaces_unavailable() {
        let store = RedisStore::new(
            Arc::new(StaticResolver::new("redis://127.0.0.1:1/0")),
            RetryPolicy { attempts: 2, backoff: Duration::from_millis(1) },
        );

        let err = store.task_count("alice").await.unwrap_err();

        assert!(matches!(err, StoreError::Unavailable { attempts: 2, .. }));
    }
}
