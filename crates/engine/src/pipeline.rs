use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use loom_common::error::IndexerError;
use loom_common::types::{CrudTag, DecodedEvent, DynamicContract};

use crate::durable::DurableStore;
use crate::runtime::{HandlerContext, HandlerRegistry, LoaderContext};
use crate::store::EntityStore;

/// Drives the two-phase (load, handle) contract for each batch.
pub struct BatchProcessor {
    handlers: HandlerRegistry,
}

impl BatchProcessor {
    pub fn new(handlers: HandlerRegistry) -> Self {
        Self { handlers }
    }

    /// Process one batch of globally ordered events against the store.
    ///
    /// 1. Run every loader, collecting unique ids per entity type.
    /// 2. One bulk read per entity type; results staged as `Read`.
    /// 3. Expand declared references exactly one hop and bulk-read those.
    /// 4. Run handlers in batch order.
    ///
    /// Returns the dynamic contract registrations made by handlers; the
    /// caller forwards them to the chain manager once the batch commits.
    pub async fn process_batch<S: DurableStore>(
        &self,
        events: &[DecodedEvent],
        store: &mut EntityStore,
        durable: &S,
    ) -> Result<Vec<DynamicContract>, IndexerError> {
        let mut loader = LoaderContext::new();
        for event in events {
            if let Some(handler) = self.handlers.get(&event.contract_type, &event.event_name) {
                handler.register_loads(event, &mut loader);
            }
        }

        for (entity, ids) in loader.requested() {
            let ids: Vec<String> = ids.iter().cloned().collect();
            let rows = durable.batch_read(entity, &ids).await?;
            stage_read_rows(store, entity, rows)?;
        }

        let follow_up = collect_references(&loader, store);
        for (entity, ids) in &follow_up {
            let ids: Vec<String> = ids
                .iter()
                .filter(|id| !store.contains(entity, id))
                .cloned()
                .collect();
            if ids.is_empty() {
                continue;
            }
            let rows = durable.batch_read(entity, &ids).await?;
            stage_read_rows(store, entity, rows)?;
        }

        let mut registrations = Vec::new();
        for event in events {
            let Some(handler) = self.handlers.get(&event.contract_type, &event.event_name) else {
                tracing::warn!(
                    contract_type = %event.contract_type,
                    event_name = %event.event_name,
                    chain_id = event.chain_id,
                    event_id = event.event_id,
                    "No handler registered for decoded event; skipping"
                );
                continue;
            };
            let mut ctx = HandlerContext::new(store, event);
            handler.handle(event, &mut ctx)?;
            registrations.extend(ctx.into_registrations());
        }

        Ok(registrations)
    }
}

fn stage_read_rows(
    store: &mut EntityStore,
    entity: &str,
    rows: Vec<Value>,
) -> Result<(), IndexerError> {
    for row in rows {
        let id = row
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                IndexerError::StoreInvariant(format!(
                    "bulk read row for entity '{entity}' lacks a string id"
                ))
            })?
            .to_string();
        store.set(entity, &id, row, CrudTag::Read, None);
    }
    Ok(())
}

/// Target ids reachable in one hop from the directly loaded entities.
fn collect_references(
    loader: &LoaderContext,
    store: &EntityStore,
) -> BTreeMap<String, BTreeSet<String>> {
    let mut follow_up: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (entity, specs) in loader.references() {
        let Some(ids) = loader.requested().get(entity) else {
            continue;
        };
        for id in ids {
            let Some(value) = store.get(entity, id) else {
                continue;
            };
            for spec in specs {
                match value.get(&spec.field) {
                    Some(Value::String(target)) => {
                        follow_up
                            .entry(spec.target_entity.clone())
                            .or_default()
                            .insert(target.clone());
                    }
                    Some(Value::Array(targets)) => {
                        for target in targets.iter().filter_map(Value::as_str) {
                            follow_up
                                .entry(spec.target_entity.clone())
                                .or_default()
                                .insert(target.to_string());
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    follow_up
}
