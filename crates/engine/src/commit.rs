use std::collections::BTreeMap;
use std::time::Duration;

use loom_common::error::IndexerError;
use loom_common::types::{CrudTag, event_block};

use crate::durable::{CommitBatch, DurableStore, RawEventRow};
use crate::store::EntityStore;

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(500);

/// Writes a batch's staged mutations to durable storage.
///
/// The staged store partitions into one bulk delete and one bulk upsert per
/// namespace; the durable store applies the whole batch in one transaction.
/// Failures retry a bounded number of times with exponential backoff; the
/// checkpoint only advances with a successful apply.
pub struct CommitEngine {
    max_attempts: u32,
    base_backoff: Duration,
}

impl CommitEngine {
    pub fn new() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff: DEFAULT_BASE_BACKOFF,
        }
    }

    pub fn with_retry(max_attempts: u32, base_backoff: Duration) -> Self {
        Self { max_attempts: max_attempts.max(1), base_backoff }
    }

    /// Partition the store into bulk operations.
    ///
    /// Rows whose final tag is `Read` are dropped; `Delete` rows become
    /// bulk deletes; `Create` and `Update` rows become bulk upserts. An
    /// upsert row without a value is a bug, not bad input.
    pub fn build_batch(
        store: &EntityStore,
        checkpoints: &BTreeMap<u64, u64>,
    ) -> Result<CommitBatch, IndexerError> {
        let mut batch = CommitBatch::default();

        for (entity, rows) in store.entity_namespaces() {
            let mut deletes = Vec::new();
            let mut upserts = Vec::new();
            for (id, row) in rows {
                match row.crud {
                    CrudTag::Read => {}
                    CrudTag::Delete => deletes.push(id.clone()),
                    CrudTag::Create | CrudTag::Update => {
                        if row.value.is_null() {
                            return Err(IndexerError::StoreInvariant(format!(
                                "null value staged for upsert of {entity} id {id}"
                            )));
                        }
                        upserts.push((id.clone(), row.value.clone()));
                    }
                }
            }
            if !deletes.is_empty() {
                batch.entity_deletes.insert(entity.clone(), deletes);
            }
            if !upserts.is_empty() {
                batch.entity_upserts.insert(entity.clone(), upserts);
            }
        }

        for ((chain_id, event_id), row) in store.raw_event_rows() {
            match row.crud {
                CrudTag::Read => {}
                CrudTag::Delete => batch.raw_event_deletes.push((*chain_id, *event_id)),
                CrudTag::Create | CrudTag::Update => batch.raw_events.push(RawEventRow {
                    chain_id: *chain_id,
                    event_id: *event_id,
                    block_number: event_block(*event_id),
                    data: row.value.clone(),
                }),
            }
        }

        for ((chain_id, address), row) in store.dynamic_contract_rows() {
            match row.crud {
                CrudTag::Read => {}
                CrudTag::Delete => batch
                    .dynamic_contract_deletes
                    .push((*chain_id, address.clone())),
                CrudTag::Create | CrudTag::Update => {
                    let contract = serde_json::from_value(row.value.clone()).map_err(|e| {
                        IndexerError::StoreInvariant(format!(
                            "staged dynamic contract for chain {chain_id} address {address} does not deserialize: {e}"
                        ))
                    })?;
                    batch.dynamic_contracts.push(contract);
                }
            }
        }

        batch.checkpoints = checkpoints.clone();
        Ok(batch)
    }

    /// Commit the staged store, resetting it on success.
    pub async fn commit<S: DurableStore>(
        &self,
        store: &mut EntityStore,
        checkpoints: &BTreeMap<u64, u64>,
        durable: &S,
    ) -> Result<(), IndexerError> {
        let batch = Self::build_batch(store, checkpoints)?;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match durable.apply(&batch).await {
                Ok(()) => {
                    store.reset();
                    return Ok(());
                }
                Err(e) if attempt < self.max_attempts => {
                    let backoff = self.base_backoff * 2u32.saturating_pow(attempt - 1);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Commit failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    return Err(IndexerError::Commit {
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}

impl Default for CommitEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_common::types::Provenance;
    use serde_json::json;

    fn provenance() -> Option<Provenance> {
        Some(Provenance { chain_id: 1, event_id: 100_000 })
    }

    #[test]
    fn read_rows_are_dropped_and_tags_partition() {
        let mut store = EntityStore::new();
        store.set("Account", "r", json!({"id": "r"}), CrudTag::Read, None);
        store.set("Account", "c", json!({"id": "c"}), CrudTag::Create, provenance());
        store.set("Account", "u", json!({"id": "u"}), CrudTag::Update, provenance());
        store.delete("Account", "d", provenance());

        let batch = CommitEngine::build_batch(&store, &BTreeMap::new()).unwrap();
        assert_eq!(batch.entity_deletes["Account"], vec!["d".to_string()]);
        let upsert_ids: Vec<&str> = batch.entity_upserts["Account"]
            .iter()
            .map(|(id, _)| id.as_str())
            .collect();
        assert_eq!(upsert_ids, vec!["c", "u"]);
    }

    #[test]
    fn empty_namespaces_are_skipped() {
        let mut store = EntityStore::new();
        store.set("Account", "r", json!({"id": "r"}), CrudTag::Read, None);

        let batch = CommitEngine::build_batch(&store, &BTreeMap::new()).unwrap();
        assert!(batch.entity_deletes.is_empty());
        assert!(batch.entity_upserts.is_empty());
    }

    #[test]
    fn null_upsert_value_is_an_invariant_violation() {
        let mut store = EntityStore::new();
        // Force the unreachable-by-construction shape directly.
        store.set("Account", "x", serde_json::Value::Null, CrudTag::Update, provenance());

        let err = CommitEngine::build_batch(&store, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, IndexerError::StoreInvariant(_)));
    }

    #[test]
    fn statement_order_is_deterministic() {
        let mut store = EntityStore::new();
        store.set("Zeta", "1", json!({"id": "1"}), CrudTag::Create, provenance());
        store.set("Alpha", "1", json!({"id": "1"}), CrudTag::Create, provenance());
        store.set("Alpha", "0", json!({"id": "0"}), CrudTag::Create, provenance());

        let batch = CommitEngine::build_batch(&store, &BTreeMap::new()).unwrap();
        let types: Vec<&String> = batch.entity_upserts.keys().collect();
        assert_eq!(types, vec!["Alpha", "Zeta"]);
        let alpha_ids: Vec<&str> = batch.entity_upserts["Alpha"]
            .iter()
            .map(|(id, _)| id.as_str())
            .collect();
        assert_eq!(alpha_ids, vec!["0", "1"]);
    }
}
