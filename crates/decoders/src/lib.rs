pub mod erc20;
pub mod gravatar;
pub mod nft;

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use alloy::primitives::{Address, B256, Log};
use chrono::{DateTime, Utc};

use loom_common::config::IndexerConfig;
use loom_common::error::IndexerError;
use loom_common::types::{DecodedEvent, pack_event_id};

/// A decoded log before block and transaction metadata is attached.
#[derive(Debug, Clone)]
pub struct DecodedLog {
    pub event_name: &'static str,
    pub params: serde_json::Value,
}

/// Trait implemented by each contract-type decoder.
///
/// Concrete implementations stand in for generator output: one decoder per
/// declared contract type, with one match arm per declared event.
pub trait EventDecoder: Send + Sync {
    /// Contract type this decoder handles (e.g. "Gravatar").
    fn contract_type(&self) -> &'static str;

    /// Topic0 signatures this decoder understands.
    fn topics(&self) -> Vec<B256>;

    /// Attempt to decode a raw log entry.
    ///
    /// `None` for a topic this decoder does not declare; `Some(Err(_))`
    /// when a declared topic fails to decode, which indicates ABI drift
    /// and is fatal upstream.
    fn decode(&self, log: &Log) -> Option<Result<DecodedLog, String>>;
}

/// Position of a log within its block and transaction, supplied by the
/// fetcher when a decoded log is promoted to a [`DecodedEvent`].
#[derive(Debug, Clone)]
pub struct LogContext {
    pub chain_id: u64,
    pub block_number: u64,
    pub block_timestamp: DateTime<Utc>,
    pub block_hash: String,
    pub tx_hash: String,
    pub tx_index: u64,
    pub log_index: u64,
}

/// Registry mapping (chain id, contract address, topic) to typed events.
///
/// Immutable after construction except for [`Self::register_address`],
/// which is the pure addition performed by the dynamic contract registrar.
pub struct DecoderRegistry {
    decoders: HashMap<&'static str, Box<dyn EventDecoder>>,
    addresses: RwLock<HashMap<(u64, Address), String>>,
    /// Events enabled per (chain id, contract type). A missing entry means
    /// every event the decoder knows is enabled.
    enabled: HashMap<(u64, String), HashSet<String>>,
    decoded: AtomicU64,
    skipped: AtomicU64,
}

impl DecoderRegistry {
    /// Create a registry with all built-in contract-type decoders and no
    /// addresses.
    pub fn new() -> Self {
        let mut registry = Self {
            decoders: HashMap::new(),
            addresses: RwLock::new(HashMap::new()),
            enabled: HashMap::new(),
            decoded: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        };
        registry.add_decoder(Box::new(gravatar::GravatarDecoder));
        registry.add_decoder(Box::new(erc20::TokenDecoder));
        registry.add_decoder(Box::new(nft::NftFactoryDecoder));
        registry.add_decoder(Box::new(nft::NftDecoder));
        registry
    }

    fn add_decoder(&mut self, decoder: Box<dyn EventDecoder>) {
        self.decoders.insert(decoder.contract_type(), decoder);
    }

    /// Build the registry from the generated configuration.
    pub fn from_config(config: &IndexerConfig) -> Result<Self, IndexerError> {
        let mut registry = Self::new();
        for chain in &config.chains {
            for contract in &chain.contracts {
                if !registry.decoders.contains_key(contract.contract_type.as_str()) {
                    return Err(IndexerError::Config(format!(
                        "no decoder for contract type '{}' on chain {}",
                        contract.contract_type, chain.chain_id
                    )));
                }
                registry.enabled.insert(
                    (chain.chain_id, contract.contract_type.clone()),
                    contract.events.iter().cloned().collect(),
                );
                let mut addresses = registry
                    .addresses
                    .write()
                    .expect("address map lock poisoned");
                for raw in &contract.addresses {
                    let address: Address = raw.parse().map_err(|_| {
                        IndexerError::Config(format!(
                            "invalid address '{raw}' for contract type '{}'",
                            contract.contract_type
                        ))
                    })?;
                    addresses.insert((chain.chain_id, address), contract.contract_type.clone());
                }
            }
        }
        Ok(registry)
    }

    /// Add a contract address for an existing contract type.
    ///
    /// Returns `true` when the address was newly added; `false` when it was
    /// already registered (re-registrations must not trigger a second
    /// back-fill).
    pub fn register_address(
        &self,
        chain_id: u64,
        address: Address,
        contract_type: &str,
    ) -> Result<bool, IndexerError> {
        if !self.decoders.contains_key(contract_type) {
            return Err(IndexerError::Config(format!(
                "no decoder for dynamically registered contract type '{contract_type}'"
            )));
        }
        let mut addresses = self.addresses.write().expect("address map lock poisoned");
        match addresses.get(&(chain_id, address)) {
            Some(existing) => {
                if existing != contract_type {
                    tracing::warn!(
                        chain_id,
                        address = %address,
                        existing,
                        requested = contract_type,
                        "Address already registered with a different contract type; keeping existing"
                    );
                }
                Ok(false)
            }
            None => {
                addresses.insert((chain_id, address), contract_type.to_string());
                tracing::info!(chain_id, address = %address, contract_type, "Registered contract address");
                Ok(true)
            }
        }
    }

    /// All registered addresses for a chain, for use in log filters.
    pub fn addresses_for_chain(&self, chain_id: u64) -> Vec<Address> {
        self.addresses
            .read()
            .expect("address map lock poisoned")
            .keys()
            .filter(|(chain, _)| *chain == chain_id)
            .map(|(_, address)| *address)
            .collect()
    }

    /// Decode a raw log into a [`DecodedEvent`].
    ///
    /// `Ok(None)` for logs from unregistered addresses, unknown topics or
    /// events disabled in the configuration; those are counted in
    /// [`Self::skipped_logs`]. A decoding failure for a declared topic is
    /// fatal and surfaces as [`IndexerError::Decode`].
    pub fn decode(&self, ctx: &LogContext, log: &Log) -> Result<Option<DecodedEvent>, IndexerError> {
        let contract_type = {
            let addresses = self.addresses.read().expect("address map lock poisoned");
            match addresses.get(&(ctx.chain_id, log.address)) {
                Some(contract_type) => contract_type.clone(),
                None => return Ok(None),
            }
        };

        let decoder = self
            .decoders
            .get(contract_type.as_str())
            .expect("registered address without decoder");

        let decoded = match decoder.decode(log) {
            Some(Ok(decoded)) => decoded,
            Some(Err(message)) => {
                let topic = log
                    .topics()
                    .first()
                    .map(|topic| format!("{topic:#x}"))
                    .unwrap_or_default();
                return Err(IndexerError::Decode {
                    chain_id: ctx.chain_id,
                    contract_type,
                    event_name: topic,
                    message,
                });
            }
            None => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    chain_id = ctx.chain_id,
                    address = %log.address,
                    contract_type,
                    "Skipping log with unknown topic"
                );
                return Ok(None);
            }
        };

        if let Some(enabled) = self.enabled.get(&(ctx.chain_id, contract_type.clone()))
            && !enabled.contains(decoded.event_name)
        {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        self.decoded.fetch_add(1, Ordering::Relaxed);
        Ok(Some(DecodedEvent {
            chain_id: ctx.chain_id,
            event_id: pack_event_id(ctx.block_number, ctx.log_index),
            block_number: ctx.block_number,
            block_timestamp: ctx.block_timestamp,
            block_hash: ctx.block_hash.clone(),
            tx_hash: ctx.tx_hash.clone(),
            tx_index: ctx.tx_index,
            log_index: ctx.log_index,
            contract_address: format!("{:#x}", log.address),
            contract_type,
            event_name: decoded.event_name.to_string(),
            params: decoded.params,
        }))
    }

    /// Logs decoded into events since startup.
    pub fn decoded_logs(&self) -> u64 {
        self.decoded.load(Ordering::Relaxed)
    }

    /// Logs skipped (unknown topic or disabled event) since startup.
    pub fn skipped_logs(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{LogData, U256};
    use alloy::sol_types::SolEvent;
    use chrono::TimeZone;

    fn test_config(addr: &str) -> IndexerConfig {
        IndexerConfig::from_json(&format!(
            r#"{{
                "chains": [{{
                    "chain_id": 1,
                    "rpc_url": "http://localhost:8545",
                    "start_block": 0,
                    "contracts": [{{
                        "contract_type": "Gravatar",
                        "addresses": ["{addr}"],
                        "events": ["NewGravatar"]
                    }}]
                }}]
            }}"#
        ))
        .unwrap()
    }

    fn ctx(block_number: u64, log_index: u64) -> LogContext {
        LogContext {
            chain_id: 1,
            block_number,
            block_timestamp: Utc.timestamp_opt(1_700_000_000, 0).single().unwrap(),
            block_hash: format!("0x{:064x}", block_number),
            tx_hash: format!("0x{:064x}", block_number * 10),
            tx_index: 0,
            log_index,
        }
    }

    fn gravatar_log(address: Address) -> Log {
        let event = gravatar::NewGravatar {
            id: U256::from(1001u64),
            owner: Address::repeat_byte(0x11),
            displayName: "d1".to_string(),
            imageUrl: "u1".to_string(),
        };
        Log { address, data: event.encode_log_data() }
    }

    #[test]
    fn decodes_a_configured_event() {
        let address = Address::repeat_byte(0x2e);
        let registry = DecoderRegistry::from_config(&test_config(&format!("{address:#x}"))).unwrap();

        let event = registry
            .decode(&ctx(100, 3), &gravatar_log(address))
            .unwrap()
            .expect("known event decodes");
        assert_eq!(event.contract_type, "Gravatar");
        assert_eq!(event.event_name, "NewGravatar");
        assert_eq!(event.event_id, 10_000_003);
        assert_eq!(event.params["id"], "1001");
        assert_eq!(registry.decoded_logs(), 1);
    }

    #[test]
    fn unknown_address_is_skipped() {
        let address = Address::repeat_byte(0x2e);
        let registry = DecoderRegistry::from_config(&test_config(&format!("{address:#x}"))).unwrap();

        let other = Address::repeat_byte(0x99);
        let decoded = registry.decode(&ctx(100, 0), &gravatar_log(other)).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn unknown_topic_is_skipped_and_counted() {
        let address = Address::repeat_byte(0x2e);
        let registry = DecoderRegistry::from_config(&test_config(&format!("{address:#x}"))).unwrap();

        let log = Log {
            address,
            data: LogData::new_unchecked(vec![B256::repeat_byte(0xab)], Default::default()),
        };
        let decoded = registry.decode(&ctx(100, 0), &log).unwrap();
        assert!(decoded.is_none());
        assert_eq!(registry.skipped_logs(), 1);
    }

    #[test]
    fn disabled_event_is_skipped() {
        // Config enables NewGravatar only; UpdatedGravatar must be dropped.
        let address = Address::repeat_byte(0x2e);
        let registry = DecoderRegistry::from_config(&test_config(&format!("{address:#x}"))).unwrap();

        let event = gravatar::UpdatedGravatar {
            id: U256::from(1001u64),
            owner: Address::repeat_byte(0x11),
            displayName: "d2".to_string(),
            imageUrl: "u2".to_string(),
        };
        let log = Log { address, data: event.encode_log_data() };
        let decoded = registry.decode(&ctx(100, 0), &log).unwrap();
        assert!(decoded.is_none());
        assert_eq!(registry.skipped_logs(), 1);
    }

    #[test]
    fn dynamic_registration_is_idempotent() {
        let registry = DecoderRegistry::new();
        let address = Address::repeat_byte(0x44);

        assert!(registry.register_address(7, address, "Nft").unwrap());
        assert!(!registry.register_address(7, address, "Nft").unwrap());
        assert_eq!(registry.addresses_for_chain(7), vec![address]);
        assert!(registry.addresses_for_chain(8).is_empty());
    }

    #[test]
    fn dynamic_registration_rejects_unknown_contract_types() {
        let registry = DecoderRegistry::new();
        let err = registry
            .register_address(7, Address::repeat_byte(0x44), "Mystery")
            .unwrap_err();
        assert!(matches!(err, IndexerError::Config(_)));
    }

    #[test]
    fn dynamically_registered_addresses_decode_all_known_events() {
        // No config entry for (chain, type): every decoder event is enabled.
        let registry = DecoderRegistry::new();
        let address = Address::repeat_byte(0x2e);
        registry.register_address(1, address, "Gravatar").unwrap();

        let event = registry
            .decode(&ctx(5, 0), &gravatar_log(address))
            .unwrap()
            .expect("decodes without an enabled-set entry");
        assert_eq!(event.event_name, "NewGravatar");
    }

    #[test]
    fn config_rejects_unknown_contract_type() {
        let config = IndexerConfig::from_json(
            r#"{
                "chains": [{
                    "chain_id": 1,
                    "rpc_url": "http://localhost:8545",
                    "start_block": 0,
                    "contracts": [{
                        "contract_type": "Mystery",
                        "addresses": [],
                        "events": []
                    }]
                }]
            }"#,
        )
        .unwrap();
        assert!(matches!(
            DecoderRegistry::from_config(&config),
            Err(IndexerError::Config(_))
        ));
    }
}
