//! Chain-layer error type.

use solana_sdk::signature::Signature;
use thiserror::Error;

/// JSON-RPC error codes that indicate a node-side hiccup rather than a bad request.
const NODE_BEHIND: i64 = -32005;
const NODE_UNHEALTHY: i64 = -32004;
const RATE_LIMITED: i64 = 429;

/// Errors raised by the RPC transport.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("malformed rpc response: {0}")]
    Decode(String),

    /// The blockhash used to sign the transaction is no longer valid.
    #[error("block height exceeded for {signature} (last valid block height {last_valid_block_height})")]
    BlockHeightExceeded {
        signature: Signature,
        last_valid_block_height: u64,
    },

    /// The transaction landed but its execution failed.
    #[error("transaction {signature} failed on chain: {reason}")]
    TransactionFailed { signature: Signature, reason: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl ChainError {
    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ChainError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status()
                        .map(|s| s.as_u16() == 429 || s.is_server_error())
                        .unwrap_or(false)
            }
            ChainError::Rpc { code, .. } => {
                matches!(*code, NODE_BEHIND | NODE_UNHEALTHY | RATE_LIMITED)
            }
            ChainError::Decode(_) => false,
            ChainError::BlockHeightExceeded { .. } => false,
            ChainError::TransactionFailed { .. } => false,
            ChainError::Cancelled => false,
        }
    }
}
