use serde::Deserialize;

use crate::error::IndexerError;

/// Process-level configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Path to the generated indexing configuration (JSON)
    pub config_path: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            config_path: std::env::var("CHAINLOOM_CONFIG")
                .unwrap_or_else(|_| "chainloom.json".to_string()),
            db_max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DB_MAX_CONNECTIONS must be a valid u32"))?,
        })
    }
}

/// Generated indexing configuration: which chains to follow, which
/// contracts and events to decode on each, and batch sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexerConfig {
    pub chains: Vec<ChainConfig>,

    #[serde(default)]
    pub batch: BatchConfig,
}

impl IndexerConfig {
    /// Parse a configuration file produced by the generator.
    pub fn from_file(path: &str) -> Result<Self, IndexerError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| IndexerError::Config(format!("cannot read {path}: {e}")))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, IndexerError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| IndexerError::Config(format!("invalid indexer config: {e}")))?;
        if config.chains.is_empty() {
            return Err(IndexerError::Config("at least one chain is required".into()));
        }
        Ok(config)
    }

    pub fn chain(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }
}

/// A single chain to index.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    pub start_block: u64,

    /// Upper bound on the number of blocks queried per `eth_getLogs` call.
    #[serde(default = "default_max_block_interval")]
    pub max_block_interval: u64,

    pub contracts: Vec<ContractConfig>,
}

/// A contract type with its statically configured addresses and the events
/// to decode from it.
#[derive(Debug, Clone, Deserialize)]
pub struct ContractConfig {
    pub contract_type: String,
    pub addresses: Vec<String>,
    pub events: Vec<String>,
}

/// Batch sizing for the chain manager and the per-chain queues.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Capacity of each per-chain queue; producers await when full.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            min_batch_size: default_min_batch_size(),
            max_batch_size: default_max_batch_size(),
            max_queue_size: default_max_queue_size(),
        }
    }
}

fn default_max_block_interval() -> u64 {
    2000
}

fn default_min_batch_size() -> usize {
    1
}

fn default_max_batch_size() -> usize {
    500
}

fn default_max_queue_size() -> usize {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_config() {
        let config = IndexerConfig::from_json(
            r#"{
                "chains": [{
                    "chain_id": 1,
                    "rpc_url": "http://localhost:8545",
                    "start_block": 100,
                    "contracts": [{
                        "contract_type": "Gravatar",
                        "addresses": ["0x2e645469f354bb4f5c8a05b3b30a929361cf77ec"],
                        "events": ["NewGravatar", "UpdatedGravatar"]
                    }]
                }]
            }"#,
        )
        .unwrap();

        let chain = config.chain(1).unwrap();
        assert_eq!(chain.start_block, 100);
        assert_eq!(chain.max_block_interval, 2000, "default applies");
        assert_eq!(chain.contracts[0].events.len(), 2);
        assert_eq!(config.batch.min_batch_size, 1);
        assert_eq!(config.batch.max_batch_size, 500);
        assert_eq!(config.batch.max_queue_size, 1000);
    }

    #[test]
    fn rejects_an_empty_chain_list() {
        let err = IndexerConfig::from_json(r#"{ "chains": [] }"#).unwrap_err();
        assert!(err.to_string().contains("at least one chain"));
    }

    #[test]
    fn batch_overrides_are_honoured() {
        let config = IndexerConfig::from_json(
            r#"{
                "chains": [{
                    "chain_id": 5,
                    "rpc_url": "http://localhost:8545",
                    "start_block": 0,
                    "max_block_interval": 512,
                    "contracts": []
                }],
                "batch": { "min_batch_size": 10, "max_batch_size": 50, "max_queue_size": 64 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.chain(5).unwrap().max_block_interval, 512);
        assert_eq!(config.batch.min_batch_size, 10);
        assert_eq!(config.batch.max_batch_size, 50);
        assert_eq!(config.batch.max_queue_size, 64);
    }
}
