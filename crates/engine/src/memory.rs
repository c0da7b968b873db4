use std::collections::BTreeMap;
use std::sync::Mutex;

use serde_json::Value;

use loom_common::error::IndexerError;
use loom_common::types::DynamicContract;

use crate::durable::{CommitBatch, DurableStore};

/// In-memory durable store for tests and dry runs.
///
/// Applies commit batches atomically under one lock, mirrors the
/// transactional writer's delete-then-upsert order, and supports an
/// injectable failure budget to exercise the commit retry path.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    entities: BTreeMap<String, BTreeMap<String, Value>>,
    raw_events: BTreeMap<(u64, u64), Value>,
    dynamic_contracts: BTreeMap<(u64, String), DynamicContract>,
    checkpoints: BTreeMap<u64, u64>,
    failures_left: u32,
    applies: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an entity row directly, bypassing the commit path.
    pub fn seed_entity(&self, entity: &str, id: &str, value: Value) {
        let mut state = self.inner.lock().expect("memory store lock poisoned");
        state
            .entities
            .entry(entity.to_string())
            .or_default()
            .insert(id.to_string(), value);
    }

    /// Make the next `n` `apply` calls fail.
    pub fn fail_next_applies(&self, n: u32) {
        self.inner
            .lock()
            .expect("memory store lock poisoned")
            .failures_left = n;
    }

    pub fn entity(&self, entity: &str, id: &str) -> Option<Value> {
        let state = self.inner.lock().expect("memory store lock poisoned");
        state.entities.get(entity)?.get(id).cloned()
    }

    pub fn entity_table(&self, entity: &str) -> BTreeMap<String, Value> {
        let state = self.inner.lock().expect("memory store lock poisoned");
        state.entities.get(entity).cloned().unwrap_or_default()
    }

    pub fn all_entities(&self) -> BTreeMap<String, BTreeMap<String, Value>> {
        self.inner
            .lock()
            .expect("memory store lock poisoned")
            .entities
            .clone()
    }

    pub fn checkpoint(&self, chain_id: u64) -> Option<u64> {
        let state = self.inner.lock().expect("memory store lock poisoned");
        state.checkpoints.get(&chain_id).copied()
    }

    pub fn raw_event_count(&self) -> usize {
        self.inner
            .lock()
            .expect("memory store lock poisoned")
            .raw_events
            .len()
    }

    pub fn dynamic_contract_count(&self) -> usize {
        self.inner
            .lock()
            .expect("memory store lock poisoned")
            .dynamic_contracts
            .len()
    }

    /// Total `apply` calls, failed ones included.
    pub fn apply_calls(&self) -> u64 {
        self.inner.lock().expect("memory store lock poisoned").applies
    }
}

impl DurableStore for MemoryStore {
    async fn batch_read(&self, entity: &str, ids: &[String]) -> Result<Vec<Value>, IndexerError> {
        let state = self.inner.lock().expect("memory store lock poisoned");
        let Some(table) = state.entities.get(entity) else {
            return Ok(Vec::new());
        };
        Ok(ids.iter().filter_map(|id| table.get(id).cloned()).collect())
    }

    async fn apply(&self, batch: &CommitBatch) -> Result<(), IndexerError> {
        let mut state = self.inner.lock().expect("memory store lock poisoned");
        state.applies += 1;
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(IndexerError::Database(sqlx::Error::Protocol(
                "injected apply failure".into(),
            )));
        }

        for (entity, ids) in &batch.entity_deletes {
            if let Some(table) = state.entities.get_mut(entity) {
                for id in ids {
                    table.remove(id);
                }
            }
        }
        for (entity, rows) in &batch.entity_upserts {
            let table = state.entities.entry(entity.clone()).or_default();
            for (id, value) in rows {
                table.insert(id.clone(), value.clone());
            }
        }

        for (chain_id, event_id) in &batch.raw_event_deletes {
            state.raw_events.remove(&(*chain_id, *event_id));
        }
        for row in &batch.raw_events {
            state
                .raw_events
                .insert((row.chain_id, row.event_id), row.data.clone());
        }

        for (chain_id, address) in &batch.dynamic_contract_deletes {
            state.dynamic_contracts.remove(&(*chain_id, address.clone()));
        }
        for contract in &batch.dynamic_contracts {
            state
                .dynamic_contracts
                .insert((contract.chain_id, contract.address.clone()), contract.clone());
        }

        for (chain_id, to_block) in &batch.checkpoints {
            state
                .checkpoints
                .entry(*chain_id)
                .and_modify(|current| *current = (*current).max(*to_block))
                .or_insert(*to_block);
        }

        Ok(())
    }

    async fn latest_processed_block(&self, chain_id: u64) -> Result<Option<u64>, IndexerError> {
        Ok(self.checkpoint(chain_id))
    }

    async fn dynamic_contracts(&self) -> Result<Vec<DynamicContract>, IndexerError> {
        let state = self.inner.lock().expect("memory store lock poisoned");
        Ok(state.dynamic_contracts.values().cloned().collect())
    }
}
