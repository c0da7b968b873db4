use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::de::DeserializeOwned;
use serde_json::Value;

use loom_common::error::IndexerError;
use loom_common::types::{CrudTag, DecodedEvent, DynamicContract, Provenance};

use crate::store::EntityStore;

/// Declares that a loaded entity's field holds the id (or ids) of another
/// entity type which should be loaded too. Followed for exactly one hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSpec {
    pub field: String,
    pub target_entity: String,
}

/// Collects the ids every loader wants read before the handle phase.
///
/// Purely declarative: no I/O happens here. The pipeline turns the
/// per-entity unique-id sets into one bulk read each.
#[derive(Debug, Default)]
pub struct LoaderContext {
    requested: BTreeMap<String, BTreeSet<String>>,
    references: BTreeMap<String, Vec<ReferenceSpec>>,
}

impl LoaderContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that `id` of `entity` will be read during the handle phase.
    pub fn load(&mut self, entity: &str, id: &str) {
        self.requested
            .entry(entity.to_string())
            .or_default()
            .insert(id.to_string());
    }

    /// Declare that `entity.field` references `target_entity` ids which
    /// should be loaded alongside.
    pub fn follow_reference(&mut self, entity: &str, field: &str, target_entity: &str) {
        let spec = ReferenceSpec {
            field: field.to_string(),
            target_entity: target_entity.to_string(),
        };
        let specs = self.references.entry(entity.to_string()).or_default();
        if !specs.contains(&spec) {
            specs.push(spec);
        }
    }

    pub(crate) fn requested(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.requested
    }

    pub(crate) fn references(&self) -> &BTreeMap<String, Vec<ReferenceSpec>> {
        &self.references
    }
}

/// Handler-facing view of the store for one event.
///
/// Getters and setters proxy into the in-memory store; handlers never read
/// durable storage directly, so an entity the loader did not request reads
/// as `None`.
pub struct HandlerContext<'a> {
    store: &'a mut EntityStore,
    provenance: Provenance,
    registrations: Vec<DynamicContract>,
}

impl<'a> HandlerContext<'a> {
    pub fn new(store: &'a mut EntityStore, event: &DecodedEvent) -> Self {
        Self {
            store,
            provenance: event.provenance(),
            registrations: Vec::new(),
        }
    }

    pub fn get(&self, entity: &str, id: &str) -> Option<Value> {
        self.store.get(entity, id).cloned()
    }

    pub fn get_as<T: DeserializeOwned>(&self, entity: &str, id: &str) -> Option<T> {
        let value = self.store.get(entity, id)?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn insert(&mut self, entity: &str, id: &str, value: Value) {
        self.store
            .set(entity, id, value, CrudTag::Create, Some(self.provenance));
    }

    pub fn update(&mut self, entity: &str, id: &str, value: Value) {
        self.store
            .set(entity, id, value, CrudTag::Update, Some(self.provenance));
    }

    pub fn delete(&mut self, entity: &str, id: &str) {
        self.store.delete(entity, id, Some(self.provenance));
    }

    /// Register a new contract address of an existing contract type on this
    /// event's chain. The address becomes a fetch target for subsequent
    /// blocks; earlier blocks are back-filled through the auxiliary queue.
    pub fn register_contract(&mut self, contract_type: &str, address: &str) {
        let contract = DynamicContract {
            chain_id: self.provenance.chain_id,
            address: address.to_string(),
            contract_type: contract_type.to_string(),
            registering_event_id: self.provenance.event_id,
        };
        self.store.stage_dynamic_contract(&contract);
        self.registrations.push(contract);
    }

    pub(crate) fn into_registrations(self) -> Vec<DynamicContract> {
        self.registrations
    }
}

/// User-supplied callbacks for one event type.
pub trait EventHandler: Send + Sync {
    /// Declarative load phase: record which entity ids the handle phase
    /// will read. Runs for every event before any handler runs.
    fn register_loads(&self, _event: &DecodedEvent, _loader: &mut LoaderContext) {}

    /// Mutation phase: runs once per event, in global order.
    fn handle(&self, event: &DecodedEvent, ctx: &mut HandlerContext<'_>)
    -> Result<(), IndexerError>;
}

/// Handlers keyed by (contract type, event name).
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, String), Box<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        contract_type: &str,
        event_name: &str,
        handler: Box<dyn EventHandler>,
    ) {
        self.handlers
            .insert((contract_type.to_string(), event_name.to_string()), handler);
    }

    pub fn get(&self, contract_type: &str, event_name: &str) -> Option<&dyn EventHandler> {
        self.handlers
            .get(&(contract_type.to_string(), event_name.to_string()))
            .map(|handler| &**handler)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
