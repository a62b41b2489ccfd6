use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{InsertOutcome, RecordStore, SwapOutcome, Versioned};
use crate::errors::StoreError;

#[derive(Default)]
struct MemoryState {
    tasks: HashMap<String, Versioned>,
    // owner -> (score, id)
    indexes: HashMap<String, BTreeSet<(i64, String)>>,
    // owner -> task id -> seconds
    usage: HashMap<String, HashMap<String, u64>>,
}

// One lock around everything, so each call is atomic like a Redis script.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert_task(
        &self,
        owner: &str,
        id: &str,
        score: i64,
        data: &str,
        limit: Option<usize>,
    ) -> Result<InsertOutcome, StoreError> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.tasks.get(id) {
            return Ok(if existing.data == data {
                InsertOutcome::Replayed
            } else {
                InsertOutcome::Collision
            });
        }

        let count = state.indexes.get(owner).map_or(0, BTreeSet::len);
        if let Some(limit) = limit {
            if count >= limit {
                return Ok(InsertOutcome::IndexFull { count });
            }
        }

        state.tasks.insert(
            id.to_string(),
            Versioned { version: 1, data: data.to_string() },
        );
        state
            .indexes
            .entry(owner.to_string())
            .or_default()
            .insert((score, id.to_string()));
        Ok(InsertOutcome::Created)
    }

    async fn load_task(&self, id: &str) -> Result<Option<Versioned>, StoreError> {
        Ok(self.state.lock().await.tasks.get(id).cloned())
    }

    async fn swap_task(&self, id: &str, expected: u64, data: &str) -> Result<SwapOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let Some(record) = state.tasks.get_mut(id) else {
            return Ok(SwapOutcome::Missing);
        };

        if record.version == expected {
            record.version += 1;
            record.data = data.to_string();
            return Ok(SwapOutcome::Applied);
        }
        // Our own write, already applied before a retry.
        if record.version == expected + 1 && record.data == data {
            return Ok(SwapOutcome::Applied);
        }
        Ok(SwapOutcome::Conflict)
    }

    async fn remove_task(&self, owner: &str, id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let existed = state.tasks.remove(id).is_some();
        if let Some(index) = state.indexes.get_mut(owner) {
            index.retain(|(_, member)| member != id);
            if index.is_empty() {
                state.indexes.remove(owner);
            }
        }
        Ok(existed)
    }

    async fn task_ids(&self, owner: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .indexes
            .get(owner)
            .map(|index| index.iter().map(|(_, id)| id.clone()).collect())
            .unwrap_or_default())
    }

    async fn task_count(&self, owner: &str) -> Result<usize, StoreError> {
        Ok(self.state.lock().await.indexes.get(owner).map_or(0, BTreeSet::len))
    }

    async fn owners(&self) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        let mut owners: Vec<String> = state.indexes.keys().cloned().collect();
        owners.sort();
        Ok(owners)
    }

    async fn record_usage(&self, owner: &str, id: &str, seconds: u64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .usage
            .entry(owner.to_string())
            .or_default()
            .insert(id.to_string(), seconds);
        Ok(())
    }

    async fn usage(&self, owner: &str) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state.usage.get(owner).map_or(0, |tasks| tasks.values().sum()))
    }
}
