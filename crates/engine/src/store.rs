use std::collections::BTreeMap;

use serde_json::Value;

use loom_common::types::{CrudTag, DecodedEvent, DynamicContract, Provenance};

/// A staged mutation for one key in one namespace.
#[derive(Debug, Clone)]
pub struct StagedRow {
    pub crud: CrudTag,
    pub value: Value,
    /// Event that last touched the row; `None` for rows staged by the bulk
    /// reader.
    pub provenance: Option<Provenance>,
}

/// Write-back store for the active batch.
///
/// One namespace per entity type plus one for raw events (keyed by
/// `(chain_id, event_id)`) and one for the dynamic contract registry
/// (keyed by `(chain_id, address)`). For any key at most one staged row
/// exists; repeated staging folds the CRUD tags. Single-threaded within a
/// batch, so no locking; BTreeMaps keep commit statement order
/// deterministic.
#[derive(Debug, Default)]
pub struct EntityStore {
    entities: BTreeMap<String, BTreeMap<String, StagedRow>>,
    raw_events: BTreeMap<(u64, u64), StagedRow>,
    dynamic_contracts: BTreeMap<(u64, String), StagedRow>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The staged entity, unless absent or staged as deleted. Reads see the
    /// batch's own uncommitted writes.
    pub fn get(&self, entity: &str, id: &str) -> Option<&Value> {
        self.entities
            .get(entity)?
            .get(id)
            .and_then(|row| (row.crud != CrudTag::Delete).then_some(&row.value))
    }

    /// Whether any row (regardless of tag) is staged for the key.
    pub fn contains(&self, entity: &str, id: &str) -> bool {
        self.entities
            .get(entity)
            .is_some_and(|namespace| namespace.contains_key(id))
    }

    /// Stage `value` under `next`, folding with any existing tag.
    ///
    /// A second `Create` for an already staged key is recorded as `Update`
    /// (the handler cannot have known whether the entity existed) and
    /// logged rather than second-guessed.
    pub fn set(
        &mut self,
        entity: &str,
        id: &str,
        value: Value,
        next: CrudTag,
        provenance: Option<Provenance>,
    ) {
        let namespace = self.entities.entry(entity.to_string()).or_default();
        match namespace.get_mut(id) {
            Some(row) => {
                if next == CrudTag::Create {
                    tracing::warn!(
                        entity,
                        id,
                        prior = %row.crud,
                        "Repeated create for a staged entity; recording update so commit upserts"
                    );
                }
                row.crud = CrudTag::fold(Some(row.crud), next);
                row.value = value;
                if provenance.is_some() {
                    row.provenance = provenance;
                }
            }
            None => {
                namespace.insert(
                    id.to_string(),
                    StagedRow { crud: next, value, provenance },
                );
            }
        }
    }

    /// Stage a deletion, keeping the previously known value (or null when
    /// the key was never staged).
    pub fn delete(&mut self, entity: &str, id: &str, provenance: Option<Provenance>) {
        let prior = self
            .entities
            .get(entity)
            .and_then(|namespace| namespace.get(id))
            .map(|row| row.value.clone())
            .unwrap_or(Value::Null);
        self.set(entity, id, prior, CrudTag::Delete, provenance);
    }

    /// Stage the raw record of a decoded event.
    pub fn stage_raw_event(&mut self, event: &DecodedEvent) {
        let value = serde_json::to_value(event).expect("decoded event serializes");
        let key = (event.chain_id, event.event_id);
        let provenance = Some(event.provenance());
        match self.raw_events.get_mut(&key) {
            Some(row) => {
                row.crud = CrudTag::fold(Some(row.crud), CrudTag::Create);
                row.value = value;
                row.provenance = provenance;
            }
            None => {
                self.raw_events.insert(
                    key,
                    StagedRow { crud: CrudTag::Create, value, provenance },
                );
            }
        }
    }

    /// Stage a dynamic contract registration.
    pub fn stage_dynamic_contract(&mut self, contract: &DynamicContract) {
        let value = serde_json::to_value(contract).expect("dynamic contract serializes");
        let key = (contract.chain_id, contract.address.clone());
        let provenance = Some(Provenance {
            chain_id: contract.chain_id,
            event_id: contract.registering_event_id,
        });
        match self.dynamic_contracts.get_mut(&key) {
            Some(row) => {
                row.crud = CrudTag::fold(Some(row.crud), CrudTag::Create);
                row.value = value;
                row.provenance = provenance;
            }
            None => {
                self.dynamic_contracts.insert(
                    key,
                    StagedRow { crud: CrudTag::Create, value, provenance },
                );
            }
        }
    }

    /// Clear every namespace.
    pub fn reset(&mut self) {
        self.entities.clear();
        self.raw_events.clear();
        self.dynamic_contracts.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.raw_events.is_empty() && self.dynamic_contracts.is_empty()
    }

    pub fn entity_namespaces(&self) -> &BTreeMap<String, BTreeMap<String, StagedRow>> {
        &self.entities
    }

    pub fn raw_event_rows(&self) -> &BTreeMap<(u64, u64), StagedRow> {
        &self.raw_events
    }

    pub fn dynamic_contract_rows(&self) -> &BTreeMap<(u64, String), StagedRow> {
        &self.dynamic_contracts
    }
}
