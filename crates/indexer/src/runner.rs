use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use loom_common::config::IndexerConfig;
use loom_common::error::IndexerError;
use loom_common::types::DecodedEvent;
use loom_decoders::DecoderRegistry;
use loom_engine::commit::CommitEngine;
use loom_engine::durable::DurableStore;
use loom_engine::pipeline::BatchProcessor;
use loom_engine::runtime::HandlerRegistry;
use loom_engine::store::EntityStore;

use crate::fetcher::ChainFetcher;
use crate::manager::{AuxQueue, ChainManager};
use crate::queue::ChainQueue;

/// The indexing core: per-chain fetcher tasks, the chain manager merging
/// them, and the strictly sequential batch pipeline
/// (load, handle, commit) — one batch at a time, so handlers observe a
/// single-threaded store.
pub struct Indexer<S: DurableStore> {
    config: IndexerConfig,
    registry: Arc<DecoderRegistry>,
    processor: BatchProcessor,
    commit: CommitEngine,
    durable: Arc<S>,
    shutdown: watch::Receiver<bool>,
}

impl<S: DurableStore + 'static> Indexer<S> {
    pub fn new(
        config: IndexerConfig,
        registry: Arc<DecoderRegistry>,
        handlers: HandlerRegistry,
        durable: Arc<S>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            registry,
            processor: BatchProcessor::new(handlers),
            commit: CommitEngine::new(),
            durable,
            shutdown,
        }
    }

    /// Run until shutdown or a fatal error.
    pub async fn start(mut self) -> Result<(), IndexerError> {
        // Contracts discovered in previous runs become fetch targets again.
        for contract in self.durable.dynamic_contracts().await? {
            let address = contract.address.parse().map_err(|_| {
                IndexerError::Config(format!(
                    "persisted dynamic contract has invalid address '{}'",
                    contract.address
                ))
            })?;
            self.registry
                .register_address(contract.chain_id, address, &contract.contract_type)?;
        }

        let aux = AuxQueue::new();
        let mut manager = ChainManager::new(aux.clone());
        let mut fetchers = JoinSet::new();

        for chain in &self.config.chains {
            let checkpoint = self.durable.latest_processed_block(chain.chain_id).await?;
            let start_block = checkpoint.map_or(chain.start_block, |block| {
                (block + 1).max(chain.start_block)
            });
            let queue = ChainQueue::new(chain.chain_id, self.config.batch.max_queue_size);
            let (commands_tx, commands_rx) = mpsc::unbounded_channel();
            manager.add_chain(queue.clone(), commands_tx);

            let fetcher = ChainFetcher::new(
                chain,
                start_block,
                Arc::clone(&self.registry),
                queue,
                aux.clone(),
                commands_rx,
            );
            fetchers.spawn(fetcher.run());
        }

        let min = self.config.batch.min_batch_size;
        let max = self.config.batch.max_batch_size;
        let mut store = EntityStore::new();

        loop {
            if *self.shutdown.borrow() {
                tracing::info!("Shutdown requested; stopping between batches");
                break;
            }

            let batch = tokio::select! {
                batch = manager.make_batch(min, max) => batch,
                Some(exit) = fetchers.join_next() => {
                    let error = flatten_fetcher_exit(exit);
                    tracing::error!(error = %error, "Chain fetcher died; aborting");
                    return Err(error);
                }
                _ = self.shutdown.changed() => continue,
            };

            self.process(&batch, &mut store, &manager).await?;
        }

        fetchers.shutdown().await;
        Ok(())
    }

    /// Stage, process and durably commit one batch, then hand its dynamic
    /// registrations to the manager so the fetchers widen their filters.
    async fn process(
        &self,
        batch: &[DecodedEvent],
        store: &mut EntityStore,
        manager: &ChainManager,
    ) -> Result<(), IndexerError> {
        if batch.is_empty() {
            return Ok(());
        }

        let checkpoints = checkpoint_targets(batch);
        tracing::info!(
            events = batch.len(),
            chains = checkpoints.len(),
            "Processing batch"
        );

        for event in batch {
            store.stage_raw_event(event);
        }

        let registrations = self
            .processor
            .process_batch(batch, store, self.durable.as_ref())
            .await?;

        self.commit
            .commit(store, &checkpoints, self.durable.as_ref())
            .await?;

        for contract in &registrations {
            manager.register_dynamic_contract(contract)?;
        }
        Ok(())
    }
}

/// Highest block per chain in the batch: the committed range end each
/// chain's checkpoint advances to.
fn checkpoint_targets(batch: &[DecodedEvent]) -> BTreeMap<u64, u64> {
    let mut targets: BTreeMap<u64, u64> = BTreeMap::new();
    for event in batch {
        targets
            .entry(event.chain_id)
            .and_modify(|block| *block = (*block).max(event.block_number))
            .or_insert(event.block_number);
    }
    targets
}

fn flatten_fetcher_exit(
    exit: Result<Result<(), IndexerError>, tokio::task::JoinError>,
) -> IndexerError {
    match exit {
        Ok(Ok(())) => IndexerError::Rpc("chain fetcher exited unexpectedly".into()),
        Ok(Err(error)) => error,
        Err(join) => IndexerError::Rpc(format!("chain fetcher panicked: {join}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn event(chain_id: u64, block_number: u64) -> DecodedEvent {
        DecodedEvent {
            chain_id,
            event_id: loom_common::types::pack_event_id(block_number, 0),
            block_number,
            block_timestamp: Utc.timestamp_opt(1_700_000_000, 0).single().unwrap(),
            block_hash: String::new(),
            tx_hash: String::new(),
            tx_index: 0,
            log_index: 0,
            contract_address: String::new(),
            contract_type: "Token".into(),
            event_name: "Transfer".into(),
            params: json!({}),
        }
    }

    #[test]
    fn checkpoint_targets_take_the_max_block_per_chain() {
        let batch = vec![event(1, 10), event(2, 7), event(1, 12), event(2, 3)];
        let targets = checkpoint_targets(&batch);
        assert_eq!(targets[&1], 12);
        assert_eq!(targets[&2], 7);
        assert_eq!(targets.len(), 2);
    }
}
