use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of logs assumed per block when packing event ids.
const EVENT_ID_STRIDE: u64 = 100_000;

/// Derive the per-chain unique event id for a log.
///
/// EVM providers do not hand out a single identifier for a log, so one is
/// packed from its position: `block_number * 100_000 + log_index`. The
/// packing assumes fewer than 100 000 logs per block.
pub fn pack_event_id(block_number: u64, log_index: u64) -> u64 {
    block_number * EVENT_ID_STRIDE + log_index
}

/// Recover the block number an event id was packed from.
pub fn event_block(event_id: u64) -> u64 {
    event_id / EVENT_ID_STRIDE
}

/// Mutation kind carried by every staged row in the in-memory store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrudTag {
    Create,
    Read,
    Update,
    Delete,
}

impl CrudTag {
    /// Fold a newly reported tag onto the current one for the same
    /// (entity type, id) within a batch.
    ///
    /// A second `Create` over any prior tag records `Update`: the handler
    /// cannot have known whether the entity already existed, so commit must
    /// use an upsert. A `Read` never downgrades an existing tag, and a
    /// `Delete` always sticks until a later `Create`/`Update` supersedes it.
    pub fn fold(prev: Option<CrudTag>, next: CrudTag) -> CrudTag {
        match (prev, next) {
            (None, next) => next,
            (Some(_), CrudTag::Create) => CrudTag::Update,
            (Some(prev), CrudTag::Read) => prev,
            (Some(CrudTag::Create), CrudTag::Update) => CrudTag::Create,
            (Some(_), CrudTag::Update) => CrudTag::Update,
            (Some(_), CrudTag::Delete) => CrudTag::Delete,
        }
    }
}

impl std::fmt::Display for CrudTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrudTag::Create => write!(f, "create"),
            CrudTag::Read => write!(f, "read"),
            CrudTag::Update => write!(f, "update"),
            CrudTag::Delete => write!(f, "delete"),
        }
    }
}

/// Global ordering key for decoded events.
///
/// Lexicographic ascending; the chain id tie-breaks cross-chain timestamp
/// collisions deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OrderingKey {
    pub timestamp: DateTime<Utc>,
    pub chain_id: u64,
    pub block_number: u64,
    pub log_index: u64,
}

impl OrderingKey {
    /// Sentinel key for a chain that has nothing to offer up to `timestamp`.
    ///
    /// Sorts after every real item from the same chain at the same
    /// timestamp, so an item wins only when strictly earlier.
    pub fn barrier(timestamp: DateTime<Utc>, chain_id: u64) -> Self {
        Self {
            timestamp,
            chain_id,
            block_number: u64::MAX,
            log_index: u64::MAX,
        }
    }
}

/// A decoded on-chain event, doubling as the raw event record persisted so
/// reprocessing never has to re-query the RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodedEvent {
    pub chain_id: u64,
    pub event_id: u64,
    pub block_number: u64,
    pub block_timestamp: DateTime<Utc>,
    pub block_hash: String,
    pub tx_hash: String,
    pub tx_index: u64,
    pub log_index: u64,
    pub contract_address: String,
    pub contract_type: String,
    pub event_name: String,
    pub params: serde_json::Value,
}

impl DecodedEvent {
    pub fn ordering_key(&self) -> OrderingKey {
        OrderingKey {
            timestamp: self.block_timestamp,
            chain_id: self.chain_id,
            block_number: self.block_number,
            log_index: self.log_index,
        }
    }

    pub fn provenance(&self) -> Provenance {
        Provenance {
            chain_id: self.chain_id,
            event_id: self.event_id,
        }
    }
}

/// Which event a staged row came from, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub chain_id: u64,
    pub event_id: u64,
}

/// A contract address registered mid-run by a handler.
///
/// Registered contracts become fetch targets for subsequent blocks on their
/// chain; events from already-fetched blocks are back-filled separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicContract {
    pub chain_id: u64,
    pub address: String,
    pub contract_type: String,
    pub registering_event_id: u64,
}

impl DynamicContract {
    /// Block in which the registering event occurred.
    pub fn registering_block(&self) -> u64 {
        event_block(self.registering_event_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn fold_from_empty_takes_the_reported_tag() {
        for next in [CrudTag::Create, CrudTag::Read, CrudTag::Update, CrudTag::Delete] {
            assert_eq!(CrudTag::fold(None, next), next);
        }
    }

    #[test]
    fn fold_table_is_exhaustive() {
        use CrudTag::*;
        // (prev, next, expected), one row per cell of the fold table.
        let table = [
            (Create, Create, Update),
            (Create, Read, Create),
            (Create, Update, Create),
            (Create, Delete, Delete),
            (Read, Create, Update),
            (Read, Read, Read),
            (Read, Update, Update),
            (Read, Delete, Delete),
            (Update, Create, Update),
            (Update, Read, Update),
            (Update, Update, Update),
            (Update, Delete, Delete),
            (Delete, Create, Update),
            (Delete, Read, Delete),
            (Delete, Update, Update),
            (Delete, Delete, Delete),
        ];
        for (prev, next, expected) in table {
            assert_eq!(
                CrudTag::fold(Some(prev), next),
                expected,
                "fold({prev}, {next})"
            );
        }
    }

    #[test]
    fn fold_sequences_left_to_right() {
        use CrudTag::*;
        let fold_all = |tags: &[CrudTag]| {
            tags.iter()
                .fold(None, |acc, &t| Some(CrudTag::fold(acc, t)))
                .unwrap()
        };
        // Create, then Delete, then Create again: conservative upsert.
        assert_eq!(fold_all(&[Create, Delete, Create]), Update);
        // A created entity updated in the same batch is still an insert.
        assert_eq!(fold_all(&[Create, Update, Update]), Create);
        // Reads never disturb the accumulated tag.
        assert_eq!(fold_all(&[Update, Read, Read]), Update);
        assert_eq!(fold_all(&[Read, Update, Delete]), Delete);
    }

    #[test]
    fn ordering_key_is_lexicographic() {
        let a = OrderingKey { timestamp: ts(10), chain_id: 2, block_number: 5, log_index: 9 };
        let b = OrderingKey { timestamp: ts(20), chain_id: 1, block_number: 1, log_index: 0 };
        assert!(a < b, "earlier timestamp wins regardless of chain");

        let c = OrderingKey { timestamp: ts(20), chain_id: 2, block_number: 0, log_index: 0 };
        assert!(b < c, "chain id breaks timestamp ties");

        let d = OrderingKey { timestamp: ts(20), chain_id: 2, block_number: 0, log_index: 1 };
        assert!(c < d, "log index breaks the rest");
    }

    #[test]
    fn barrier_sorts_after_same_chain_items() {
        let item = OrderingKey { timestamp: ts(30), chain_id: 1, block_number: 7, log_index: 3 };
        let barrier = OrderingKey::barrier(ts(30), 1);
        assert!(item < barrier);
        // But an item at a later timestamp loses to the barrier.
        let later = OrderingKey { timestamp: ts(31), chain_id: 2, block_number: 0, log_index: 0 };
        assert!(barrier < later);
    }

    #[test]
    fn event_id_round_trips_the_block() {
        let id = pack_event_id(123_456, 42);
        assert_eq!(id, 12_345_600_042);
        assert_eq!(event_block(id), 123_456);
    }
}
