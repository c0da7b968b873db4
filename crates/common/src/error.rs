use thiserror::Error;

/// Error kinds the indexing core produces or recovers from.
///
/// Transient RPC failures are handled inside the fetchers (backoff plus
/// interval shrinkage) and never surface through this type.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("decode error for {contract_type}.{event_name} on chain {chain_id}: {message}")]
    Decode {
        chain_id: u64,
        contract_type: String,
        event_name: String,
        message: String,
    },

    #[error("unknown chain: {0}")]
    UnknownChain(u64),

    #[error("store invariant violated: {0}")]
    StoreInvariant(String),

    #[error("commit failed after {attempts} attempts: {message}")]
    Commit { attempts: u32, message: String },

    #[error("configuration error: {0}")]
    Config(String),
}
