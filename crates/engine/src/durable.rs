use std::collections::BTreeMap;

use serde_json::Value;

use loom_common::error::IndexerError;
use loom_common::types::DynamicContract;

/// Raw event record as written to durable storage.
#[derive(Debug, Clone)]
pub struct RawEventRow {
    pub chain_id: u64,
    pub event_id: u64,
    pub block_number: u64,
    pub data: Value,
}

/// Everything one batch writes to durable storage.
///
/// Maps are keyed by entity type so iteration (and therefore statement
/// order) is deterministic across runs.
#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    pub entity_deletes: BTreeMap<String, Vec<String>>,
    pub entity_upserts: BTreeMap<String, Vec<(String, Value)>>,
    pub raw_events: Vec<RawEventRow>,
    pub raw_event_deletes: Vec<(u64, u64)>,
    pub dynamic_contracts: Vec<DynamicContract>,
    pub dynamic_contract_deletes: Vec<(u64, String)>,
    /// Per-chain `latest_processed_block` advanced by this batch.
    pub checkpoints: BTreeMap<u64, u64>,
}

impl CommitBatch {
    pub fn is_empty(&self) -> bool {
        self.entity_deletes.is_empty()
            && self.entity_upserts.is_empty()
            && self.raw_events.is_empty()
            && self.raw_event_deletes.is_empty()
            && self.dynamic_contracts.is_empty()
            && self.dynamic_contract_deletes.is_empty()
            && self.checkpoints.is_empty()
    }
}

/// Seam to durable storage.
///
/// `apply` must execute the whole batch atomically: either every mutation
/// and checkpoint lands, or none do. Statement assembly and schema are the
/// implementation's concern; rows travel as plain JSON values with a
/// mandatory string `id` field.
#[allow(async_fn_in_trait)]
pub trait DurableStore: Send + Sync {
    /// Read the named ids of one entity type in a single round trip.
    /// Missing ids are simply absent from the result.
    async fn batch_read(&self, entity: &str, ids: &[String]) -> Result<Vec<Value>, IndexerError>;

    /// Apply a commit batch inside a single transaction.
    async fn apply(&self, batch: &CommitBatch) -> Result<(), IndexerError>;

    /// Checkpoint for a chain, if any batch has ever committed for it.
    async fn latest_processed_block(&self, chain_id: u64) -> Result<Option<u64>, IndexerError>;

    /// Full dynamic contract registry, for startup restore.
    async fn dynamic_contracts(&self) -> Result<Vec<DynamicContract>, IndexerError>;
}
