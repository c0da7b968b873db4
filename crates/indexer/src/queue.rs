use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, watch};

use loom_common::types::{DecodedEvent, OrderingKey};

/// Result of peeking a chain queue's front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeekFront {
    /// Ordering key of the front item.
    Item(OrderingKey),
    /// Nothing queued; the chain has nothing to offer up to
    /// `latest_fetched` (`None` before the first completed window).
    NoItem {
        latest_fetched: Option<DateTime<Utc>>,
        chain_id: u64,
    },
}

impl PeekFront {
    /// Key used when merging fronts across chains. An empty queue
    /// contributes a barrier at its latest fetched timestamp; before the
    /// first window that is the epoch, which holds everything back until
    /// the chain has reported once.
    pub fn merge_key(&self) -> OrderingKey {
        match self {
            PeekFront::Item(key) => *key,
            PeekFront::NoItem { latest_fetched, chain_id } => OrderingKey::barrier(
                latest_fetched.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
                *chain_id,
            ),
        }
    }

    pub fn is_item(&self) -> bool {
        matches!(self, PeekFront::Item(_))
    }
}

/// Bounded queue between one chain fetcher and the chain manager.
///
/// The producer awaits space when the queue is full, which is the
/// manager's backpressure. A watch revision bumps on every enqueue and on
/// every completed query window, so the manager can await "new range
/// queried" without polling. Within a chain, items enter (and therefore
/// leave) in strictly ascending `(block_number, log_index)`.
#[derive(Clone)]
pub struct ChainQueue {
    shared: Arc<QueueShared>,
}

struct QueueShared {
    chain_id: u64,
    capacity: usize,
    state: Mutex<QueueState>,
    space: Notify,
    progress: watch::Sender<u64>,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<DecodedEvent>,
    latest_fetched: Option<(u64, DateTime<Utc>)>,
    revision: u64,
}

impl ChainQueue {
    pub fn new(chain_id: u64, capacity: usize) -> Self {
        let (progress, _) = watch::channel(0);
        Self {
            shared: Arc::new(QueueShared {
                chain_id,
                capacity: capacity.max(1),
                state: Mutex::new(QueueState::default()),
                space: Notify::new(),
                progress,
            }),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.shared.chain_id
    }

    /// Enqueue an item, awaiting space when the queue is full.
    pub async fn push(&self, event: DecodedEvent) {
        let mut event = Some(event);
        loop {
            let notified = self.shared.space.notified();
            {
                let mut state = self.shared.state.lock().expect("queue lock poisoned");
                if state.items.len() < self.shared.capacity {
                    state.items.push_back(event.take().expect("event pushed twice"));
                    state.revision += 1;
                    let revision = state.revision;
                    drop(state);
                    let _ = self.shared.progress.send(revision);
                    return;
                }
            }
            notified.await;
        }
    }

    /// Record that a query window up to `block` completed, with that
    /// block's timestamp. Bumps progress even when the window was empty.
    pub fn mark_fetched(&self, block: u64, timestamp: DateTime<Utc>) {
        let revision = {
            let mut state = self.shared.state.lock().expect("queue lock poisoned");
            state.latest_fetched = Some((block, timestamp));
            state.revision += 1;
            state.revision
        };
        let _ = self.shared.progress.send(revision);
    }

    /// Highest block a completed window has covered, if any.
    pub fn latest_fetched_block(&self) -> Option<u64> {
        self.shared
            .state
            .lock()
            .expect("queue lock poisoned")
            .latest_fetched
            .map(|(block, _)| block)
    }

    pub fn peek(&self) -> PeekFront {
        let state = self.shared.state.lock().expect("queue lock poisoned");
        match state.items.front() {
            Some(event) => PeekFront::Item(event.ordering_key()),
            None => PeekFront::NoItem {
                latest_fetched: state.latest_fetched.map(|(_, ts)| ts),
                chain_id: self.shared.chain_id,
            },
        }
    }

    pub fn pop(&self) -> Option<DecodedEvent> {
        let event = self
            .shared
            .state
            .lock()
            .expect("queue lock poisoned")
            .items
            .pop_front();
        if event.is_some() {
            self.shared.space.notify_one();
        }
        event
    }

    /// Receiver that changes on every enqueue and completed window.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.progress.subscribe()
    }

    pub fn len(&self) -> usize {
        self.shared
            .state
            .lock()
            .expect("queue lock poisoned")
            .items
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::time::Duration;

    fn event(chain_id: u64, block: u64, log_index: u64, secs: i64) -> DecodedEvent {
        DecodedEvent {
            chain_id,
            event_id: loom_common::types::pack_event_id(block, log_index),
            block_number: block,
            block_timestamp: Utc.timestamp_opt(secs, 0).single().unwrap(),
            block_hash: String::new(),
            tx_hash: String::new(),
            tx_index: 0,
            log_index,
            contract_address: String::new(),
            contract_type: "Gravatar".into(),
            event_name: "NewGravatar".into(),
            params: json!({}),
        }
    }

    #[tokio::test]
    async fn push_pop_preserves_order() {
        let queue = ChainQueue::new(1, 10);
        queue.push(event(1, 5, 0, 100)).await;
        queue.push(event(1, 5, 1, 100)).await;

        assert!(queue.peek().is_item());
        assert_eq!(queue.pop().unwrap().log_index, 0);
        assert_eq!(queue.pop().unwrap().log_index, 1);
        assert!(queue.pop().is_none());
    }

    #[tokio::test]
    async fn peek_reports_latest_fetched_when_empty() {
        let queue = ChainQueue::new(3, 10);
        assert_eq!(
            queue.peek(),
            PeekFront::NoItem { latest_fetched: None, chain_id: 3 }
        );

        let ts = Utc.timestamp_opt(500, 0).single().unwrap();
        queue.mark_fetched(42, ts);
        assert_eq!(
            queue.peek(),
            PeekFront::NoItem { latest_fetched: Some(ts), chain_id: 3 }
        );
        assert_eq!(queue.latest_fetched_block(), Some(42));
    }

    #[tokio::test]
    async fn full_queue_blocks_the_producer_until_a_pop() {
        let queue = ChainQueue::new(1, 1);
        queue.push(event(1, 1, 0, 10)).await;

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(event(1, 1, 1, 10)).await })
        };

        // The producer cannot finish while the queue is full.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        assert_eq!(queue.pop().unwrap().log_index, 0);
        tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("producer unblocked")
            .unwrap();
        assert_eq!(queue.pop().unwrap().log_index, 1);
    }

    #[tokio::test]
    async fn progress_fires_on_enqueue_and_window_completion() {
        let queue = ChainQueue::new(1, 4);
        let mut rx = queue.subscribe();

        queue.push(event(1, 1, 0, 10)).await;
        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .expect("enqueue bumps progress")
            .unwrap();

        queue.mark_fetched(1, Utc.timestamp_opt(10, 0).single().unwrap());
        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .expect("window completion bumps progress")
            .unwrap();
    }
}
