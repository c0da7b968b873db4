use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::{Arc, Mutex};

use alloy::primitives::Address;
use tokio::sync::{mpsc, watch};

use loom_common::error::IndexerError;
use loom_common::types::{DecodedEvent, DynamicContract, OrderingKey};

use crate::fetcher::FetcherCommand;
use crate::queue::{ChainQueue, PeekFront};

/// Auxiliary priority queue for events that cannot ride the per-chain
/// queues without breaking their monotonicity: back-filled logs of
/// dynamically registered contracts.
#[derive(Clone)]
pub struct AuxQueue {
    shared: Arc<AuxShared>,
}

struct AuxShared {
    heap: Mutex<BinaryHeap<Reverse<AuxItem>>>,
    progress: watch::Sender<u64>,
}

struct AuxItem(DecodedEvent);

impl PartialEq for AuxItem {
    fn eq(&self, other: &Self) -> bool {
        self.0.ordering_key() == other.0.ordering_key()
    }
}

impl Eq for AuxItem {}

impl PartialOrd for AuxItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AuxItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.ordering_key().cmp(&other.0.ordering_key())
    }
}

impl AuxQueue {
    pub fn new() -> Self {
        let (progress, _) = watch::channel(0);
        Self {
            shared: Arc::new(AuxShared { heap: Mutex::new(BinaryHeap::new()), progress }),
        }
    }

    pub fn push(&self, event: DecodedEvent) {
        self.shared
            .heap
            .lock()
            .expect("aux heap lock poisoned")
            .push(Reverse(AuxItem(event)));
        self.shared.progress.send_modify(|revision| *revision += 1);
    }

    pub fn peek_key(&self) -> Option<OrderingKey> {
        self.shared
            .heap
            .lock()
            .expect("aux heap lock poisoned")
            .peek()
            .map(|Reverse(item)| item.0.ordering_key())
    }

    pub fn pop(&self) -> Option<DecodedEvent> {
        self.shared
            .heap
            .lock()
            .expect("aux heap lock poisoned")
            .pop()
            .map(|Reverse(item)| item.0)
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.progress.subscribe()
    }

    pub fn len(&self) -> usize {
        self.shared.heap.lock().expect("aux heap lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AuxQueue {
    fn default() -> Self {
        Self::new()
    }
}

struct ChainHandle {
    queue: ChainQueue,
    progress: watch::Receiver<u64>,
    commands: mpsc::UnboundedSender<FetcherCommand>,
}

/// Where the globally earliest candidate currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Earliest {
    Chain(u64),
    Aux,
    /// The minimum is an empty chain's barrier: nothing may be emitted
    /// until that chain reports progress.
    Barrier(u64),
    Nothing,
}

/// Merges the per-chain queues and the auxiliary priority queue into one
/// stream ordered by `(timestamp, chain_id, block_number, log_index)`.
pub struct ChainManager {
    chains: BTreeMap<u64, ChainHandle>,
    aux: AuxQueue,
    aux_progress: watch::Receiver<u64>,
}

impl ChainManager {
    pub fn new(aux: AuxQueue) -> Self {
        let aux_progress = aux.subscribe();
        Self { chains: BTreeMap::new(), aux, aux_progress }
    }

    pub fn add_chain(&mut self, queue: ChainQueue, commands: mpsc::UnboundedSender<FetcherCommand>) {
        let progress = queue.subscribe();
        self.chains
            .insert(queue.chain_id(), ChainHandle { queue, progress, commands });
    }

    pub fn aux(&self) -> AuxQueue {
        self.aux.clone()
    }

    /// Globally earliest candidate across every chain front and the aux
    /// heap top.
    fn earliest(&self) -> Earliest {
        let mut best: Option<(OrderingKey, Earliest)> = None;
        for (chain_id, handle) in &self.chains {
            let front = handle.queue.peek();
            let key = front.merge_key();
            let source = if front.is_item() {
                Earliest::Chain(*chain_id)
            } else {
                Earliest::Barrier(*chain_id)
            };
            if best.as_ref().is_none_or(|(best_key, _)| key < *best_key) {
                best = Some((key, source));
            }
        }
        if let Some(key) = self.aux.peek_key()
            && best.as_ref().is_none_or(|(best_key, _)| key < *best_key)
        {
            best = Some((key, Earliest::Aux));
        }
        best.map_or(Earliest::Nothing, |(_, source)| source)
    }

    /// Pop the globally earliest item if one is available synchronously.
    ///
    /// When the minimum is an empty chain's barrier nothing can be emitted
    /// safely, so this returns `None`; that is not an error.
    pub fn pop_sync(&mut self) -> Option<DecodedEvent> {
        match self.earliest() {
            Earliest::Chain(chain_id) => self.chains[&chain_id].queue.pop(),
            Earliest::Aux => self.aux.pop(),
            Earliest::Barrier(_) | Earliest::Nothing => None,
        }
    }

    /// Pop the globally earliest item, awaiting fetcher progress when an
    /// empty chain holds the stream back. This is the core's suspension
    /// point.
    pub async fn pop_async(&mut self) -> DecodedEvent {
        loop {
            let blocking_chain = match self.earliest() {
                Earliest::Chain(chain_id) => {
                    if let Some(event) = self.chains[&chain_id].queue.pop() {
                        return event;
                    }
                    continue;
                }
                Earliest::Aux => {
                    if let Some(event) = self.aux.pop() {
                        return event;
                    }
                    continue;
                }
                Earliest::Barrier(chain_id) => Some(chain_id),
                Earliest::Nothing => None,
            };

            // Wait for the blocking chain to report a new range (or for a
            // back-fill to land in the aux heap, which can be earlier than
            // any barrier).
            match blocking_chain {
                Some(chain_id) => {
                    let handle = self.chains.get_mut(&chain_id).expect("barrier for known chain");
                    tokio::select! {
                        _ = changed_or_pending(&mut handle.progress) => {}
                        _ = changed_or_pending(&mut self.aux_progress) => {}
                    }
                }
                None => changed_or_pending(&mut self.aux_progress).await,
            }
        }
    }

    /// Collect at least `min` items (awaiting as needed), then drain
    /// whatever more is synchronously available up to `max`.
    pub async fn make_batch(&mut self, min: usize, max: usize) -> Vec<DecodedEvent> {
        let min = min.max(1);
        let max = max.max(min);
        let mut batch = Vec::with_capacity(min);
        while batch.len() < min {
            batch.push(self.pop_async().await);
        }
        while batch.len() < max {
            match self.pop_sync() {
                Some(event) => batch.push(event),
                None => break,
            }
        }
        batch
    }

    /// Forward a handler's dynamic registration to the owning fetcher.
    pub fn register_dynamic_contract(&self, contract: &DynamicContract) -> Result<(), IndexerError> {
        let handle = self
            .chains
            .get(&contract.chain_id)
            .ok_or(IndexerError::UnknownChain(contract.chain_id))?;
        let address: Address = contract.address.parse().map_err(|_| {
            IndexerError::Config(format!(
                "invalid dynamically registered address '{}'",
                contract.address
            ))
        })?;
        handle
            .commands
            .send(FetcherCommand::RegisterContract {
                address,
                contract_type: contract.contract_type.clone(),
                registered_at_block: contract.registering_block(),
            })
            .map_err(|_| {
                IndexerError::Rpc(format!("chain {} fetcher is not running", contract.chain_id))
            })
    }
}

/// Await the next watch change; a closed channel parks forever (the runner
/// notices dead fetcher tasks through its join set, not through here).
async fn changed_or_pending(rx: &mut watch::Receiver<u64>) {
    if rx.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}
