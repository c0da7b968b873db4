use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log};
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use loom_common::config::ChainConfig;
use loom_common::error::IndexerError;
use loom_common::types::DecodedEvent;
use loom_decoders::{DecoderRegistry, LogContext};

use crate::manager::AuxQueue;
use crate::queue::ChainQueue;

/// Timeout for one outstanding RPC request.
const RPC_TIMEOUT: Duration = Duration::from_secs(20);
/// Delay before retrying after an RPC failure or timeout.
const BACKOFF_DELAY: Duration = Duration::from_secs(5);
/// Delay between head polls once the fetcher has caught up.
const HEAD_POLL_DELAY: Duration = Duration::from_millis(1500);

/// Shrink the query interval after a failed or timed-out window.
fn shrink_interval(interval: u64) -> u64 {
    (interval * 8 / 10).max(1)
}

/// Restore the interval toward the configured maximum after a successful
/// window. Additive, so one good window cannot swing the fetcher back to a
/// size the endpoint just rejected.
fn grow_interval(interval: u64, max_interval: u64) -> u64 {
    (interval + (max_interval / 10).max(1)).min(max_interval)
}

/// Instruction sent to a fetcher by the chain manager.
#[derive(Debug, Clone)]
pub enum FetcherCommand {
    /// Widen the filter set with a dynamically registered address; blocks
    /// already fetched are back-filled into the auxiliary queue.
    RegisterContract {
        address: Address,
        contract_type: String,
        registered_at_block: u64,
    },
}

/// Fetches one chain's logs over a sliding block window and feeds the
/// bounded per-chain queue in `(block_number, log_index)` order.
pub struct ChainFetcher {
    chain_id: u64,
    rpc_url: String,
    start_block: u64,
    max_interval: u64,
    registry: Arc<DecoderRegistry>,
    queue: ChainQueue,
    aux: AuxQueue,
    commands: mpsc::UnboundedReceiver<FetcherCommand>,
}

impl ChainFetcher {
    pub fn new(
        config: &ChainConfig,
        start_block: u64,
        registry: Arc<DecoderRegistry>,
        queue: ChainQueue,
        aux: AuxQueue,
        commands: mpsc::UnboundedReceiver<FetcherCommand>,
    ) -> Self {
        Self {
            chain_id: config.chain_id,
            rpc_url: config.rpc_url.clone(),
            start_block,
            max_interval: config.max_block_interval.max(1),
            registry,
            queue,
            aux,
            commands,
        }
    }

    /// Run until shutdown (the runner aborts the task) or a fatal error.
    ///
    /// Transient RPC failures never surface: the fetcher sleeps 5 s,
    /// shrinks the window and retries the same `from` indefinitely. A
    /// decode failure for a declared topic is fatal.
    pub async fn run(mut self) -> Result<(), IndexerError> {
        let url = self
            .rpc_url
            .parse()
            .map_err(|e| IndexerError::Rpc(format!("invalid rpc url '{}': {e}", self.rpc_url)))?;
        let provider = ProviderBuilder::new().connect_http(url);

        let mut from = self.start_block;
        let mut interval = self.max_interval;

        tracing::info!(
            chain_id = self.chain_id,
            start_block = from,
            max_block_interval = self.max_interval,
            "Chain fetcher started"
        );

        loop {
            self.drain_commands(&provider).await?;

            let head = match tokio::time::timeout(RPC_TIMEOUT, provider.get_block_number()).await {
                Ok(Ok(head)) => head,
                Ok(Err(e)) => {
                    tracing::warn!(chain_id = self.chain_id, error = %e, "Head query failed; backing off");
                    tokio::time::sleep(BACKOFF_DELAY).await;
                    continue;
                }
                Err(_) => {
                    tracing::warn!(chain_id = self.chain_id, "Head query timed out; backing off");
                    tokio::time::sleep(BACKOFF_DELAY).await;
                    continue;
                }
            };

            if from > head {
                tokio::time::sleep(HEAD_POLL_DELAY).await;
                continue;
            }

            let to = (from + interval - 1).min(head);
            let executed = to - from + 1;
            let mut block_meta: HashMap<u64, (DateTime<Utc>, String)> = HashMap::new();

            let addresses = self.registry.addresses_for_chain(self.chain_id);
            if !addresses.is_empty() {
                let filter = Filter::new().from_block(from).to_block(to).address(addresses);
                let logs = match tokio::time::timeout(RPC_TIMEOUT, provider.get_logs(&filter)).await
                {
                    Ok(Ok(logs)) => logs,
                    Ok(Err(e)) => {
                        let next = shrink_interval(interval);
                        tracing::warn!(
                            chain_id = self.chain_id,
                            from,
                            to,
                            interval,
                            next_interval = next,
                            error = %e,
                            "getLogs failed; backing off with a smaller window"
                        );
                        interval = next;
                        tokio::time::sleep(BACKOFF_DELAY).await;
                        continue;
                    }
                    Err(_) => {
                        let next = shrink_interval(interval);
                        tracing::warn!(
                            chain_id = self.chain_id,
                            from,
                            to,
                            interval,
                            next_interval = next,
                            "getLogs timed out; backing off with a smaller window"
                        );
                        interval = next;
                        tokio::time::sleep(BACKOFF_DELAY).await;
                        continue;
                    }
                };

                let events = self.decode_logs(&provider, logs, &mut block_meta).await?;
                for event in events {
                    self.queue.push(event).await;
                }
            }

            // Publish progress up to the end of the window even when it was
            // empty; the chain manager's barrier depends on it.
            let (to_timestamp, _) = self.block_timestamp(&provider, to, &mut block_meta).await;
            self.queue.mark_fetched(to, to_timestamp);

            tracing::debug!(chain_id = self.chain_id, from, to, executed, "Window fetched");
            from = to + 1;
            interval = grow_interval(interval, self.max_interval);
        }
    }

    /// Handle pending manager commands without blocking the fetch loop.
    async fn drain_commands(&mut self, provider: &impl Provider) -> Result<(), IndexerError> {
        loop {
            match self.commands.try_recv() {
                Ok(FetcherCommand::RegisterContract {
                    address,
                    contract_type,
                    registered_at_block,
                }) => {
                    let newly_added =
                        self.registry
                            .register_address(self.chain_id, address, &contract_type)?;
                    if !newly_added {
                        continue;
                    }
                    if let Some(latest) = self.queue.latest_fetched_block()
                        && registered_at_block <= latest
                    {
                        self.backfill(provider, address, registered_at_block, latest)
                            .await?;
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(()),
            }
        }
    }

    /// Fetch a dynamically registered contract's logs across blocks this
    /// fetcher has already covered. Decoded events go to the auxiliary
    /// priority queue so the per-chain queue stays monotonic.
    async fn backfill(
        &self,
        provider: &impl Provider,
        address: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<(), IndexerError> {
        tracing::info!(
            chain_id = self.chain_id,
            address = %address,
            from_block,
            to_block,
            "Back-filling dynamically registered contract"
        );

        let mut block_meta: HashMap<u64, (DateTime<Utc>, String)> = HashMap::new();
        let mut from = from_block;
        let mut interval = self.max_interval;
        while from <= to_block {
            let to = (from + interval - 1).min(to_block);
            let filter = Filter::new().from_block(from).to_block(to).address(address);
            let logs = match tokio::time::timeout(RPC_TIMEOUT, provider.get_logs(&filter)).await {
                Ok(Ok(logs)) => logs,
                Ok(Err(e)) => {
                    let next = shrink_interval(interval);
                    tracing::warn!(
                        chain_id = self.chain_id,
                        from,
                        to,
                        next_interval = next,
                        error = %e,
                        "Back-fill getLogs failed; backing off"
                    );
                    interval = next;
                    tokio::time::sleep(BACKOFF_DELAY).await;
                    continue;
                }
                Err(_) => {
                    let next = shrink_interval(interval);
                    tracing::warn!(
                        chain_id = self.chain_id,
                        from,
                        to,
                        next_interval = next,
                        "Back-fill getLogs timed out; backing off"
                    );
                    interval = next;
                    tokio::time::sleep(BACKOFF_DELAY).await;
                    continue;
                }
            };

            let events = self.decode_logs(provider, logs, &mut block_meta).await?;
            for event in events {
                self.aux.push(event);
            }

            from = to + 1;
            interval = grow_interval(interval, self.max_interval);
        }
        Ok(())
    }

    /// Decode a window's logs in `(block_number, log_index)` order,
    /// memoising one `getBlock` per unique block number.
    async fn decode_logs(
        &self,
        provider: &impl Provider,
        mut logs: Vec<Log>,
        block_meta: &mut HashMap<u64, (DateTime<Utc>, String)>,
    ) -> Result<Vec<DecodedEvent>, IndexerError> {
        logs.sort_by_key(|log| (log.block_number.unwrap_or(0), log.log_index.unwrap_or(0)));

        let mut events = Vec::new();
        for log in &logs {
            let (Some(block_number), Some(log_index)) = (log.block_number, log.log_index) else {
                // Pending logs carry no position; a closed range never
                // returns them.
                continue;
            };
            let (block_timestamp, block_hash) =
                self.block_timestamp(provider, block_number, block_meta).await;
            let ctx = LogContext {
                chain_id: self.chain_id,
                block_number,
                block_timestamp,
                block_hash,
                tx_hash: log
                    .transaction_hash
                    .map(|hash| format!("{hash:#x}"))
                    .unwrap_or_default(),
                tx_index: log.transaction_index.unwrap_or(0),
                log_index,
            };
            if let Some(event) = self.registry.decode(&ctx, &log.inner)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Timestamp and hash of a block, retrying indefinitely. A null block
    /// response is treated exactly like an RPC error.
    async fn block_timestamp(
        &self,
        provider: &impl Provider,
        block_number: u64,
        block_meta: &mut HashMap<u64, (DateTime<Utc>, String)>,
    ) -> (DateTime<Utc>, String) {
        if let Some(meta) = block_meta.get(&block_number) {
            return meta.clone();
        }
        loop {
            match tokio::time::timeout(RPC_TIMEOUT, provider.get_block_by_number(block_number.into()))
                .await
            {
                Ok(Ok(Some(block))) => {
                    let timestamp = Utc
                        .timestamp_opt(block.header.timestamp as i64, 0)
                        .single()
                        .unwrap_or_else(Utc::now);
                    let meta = (timestamp, format!("{:#x}", block.header.hash));
                    block_meta.insert(block_number, meta.clone());
                    return meta;
                }
                Ok(Ok(None)) => {
                    tracing::warn!(
                        chain_id = self.chain_id,
                        block_number,
                        "Null block response; retrying"
                    );
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        chain_id = self.chain_id,
                        block_number,
                        error = %e,
                        "getBlock failed; retrying"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        chain_id = self.chain_id,
                        block_number,
                        "getBlock timed out; retrying"
                    );
                }
            }
            tokio::time::sleep(BACKOFF_DELAY).await;
        }
    }
}
