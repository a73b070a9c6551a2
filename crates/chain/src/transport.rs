//! Transport abstraction over the ledger RPC.
//!
//! The submitter and executor only talk to the chain through [`RpcTransport`],
//! so tests can drive them with scripted in-memory implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use solana_sdk::hash::Hash;
use solana_sdk::signature::Signature;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ChainError;

/// Consecutive failed block height checks after which the default
/// confirmation strategy gives up on an unreachable node.
pub const MAX_HEIGHT_CHECK_FAILURES: u32 = 10;

/// Commitment level used for reads and confirmations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Commitment {
    Processed,
    Confirmed,
    Finalized,
}

impl Commitment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Commitment::Processed => "processed",
            Commitment::Confirmed => "confirmed",
            Commitment::Finalized => "finalized",
        }
    }
}

impl Default for Commitment {
    fn default() -> Self {
        Commitment::Confirmed
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Commitment {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "processed" | "recent" => Ok(Commitment::Processed),
            "confirmed" | "single" | "singlegossip" => Ok(Commitment::Confirmed),
            "finalized" | "max" | "root" => Ok(Commitment::Finalized),
            other => Err(ChainError::Decode(format!("unknown commitment: {other}"))),
        }
    }
}

/// Recent blockhash with the last block height at which it is still accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockhashInfo {
    pub blockhash: Hash,
    pub last_valid_block_height: u64,
}

/// Status of a submitted signature as reported by `getSignatureStatuses`.
#[derive(Debug, Clone, PartialEq)]
pub struct SignatureStatus {
    pub slot: u64,
    pub confirmation_status: Option<Commitment>,
    /// Execution error, if the transaction landed but failed.
    pub err: Option<String>,
}

impl SignatureStatus {
    /// True once the signature reached at least `confirmed`.
    pub fn is_confirmed(&self) -> bool {
        matches!(
            self.confirmation_status,
            Some(Commitment::Confirmed) | Some(Commitment::Finalized)
        )
    }
}

/// Full transaction record returned by `getTransaction`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub slot: u64,
    #[serde(default, rename = "blockTime")]
    pub block_time: Option<i64>,
    /// Execution metadata, left uninterpreted.
    #[serde(default)]
    pub meta: serde_json::Value,
}

/// RPC operations needed to submit and track transactions.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Fetch a recent blockhash together with its expiry height.
    async fn get_latest_blockhash(&self) -> Result<BlockhashInfo, ChainError>;

    /// Current block height at the configured commitment.
    async fn get_block_height(&self) -> Result<u64, ChainError>;

    /// Broadcast a serialized, signed transaction.
    async fn send_raw_transaction(
        &self,
        wire: &[u8],
        skip_preflight: bool,
    ) -> Result<Signature, ChainError>;

    /// Status of a single signature, `None` if the node has not seen it.
    async fn get_signature_status(
        &self,
        signature: &Signature,
    ) -> Result<Option<SignatureStatus>, ChainError>;

    /// Transaction record at `confirmed` commitment, `None` if not yet indexed.
    async fn get_transaction(
        &self,
        signature: &Signature,
    ) -> Result<Option<TransactionRecord>, ChainError>;

    /// Wait until `signature` is confirmed or the block height passes
    /// `last_valid_block_height`.
    ///
    /// The default strategy alternates a status check with a block height
    /// check, sleeping `poll_interval` between rounds. Returns
    /// [`ChainError::BlockHeightExceeded`] on expiry and
    /// [`ChainError::Cancelled`] once `cancel` fires. The last error is
    /// returned after [`MAX_HEIGHT_CHECK_FAILURES`] block height checks fail
    /// in a row, since expiry can no longer be observed.
    async fn confirm_transaction(
        &self,
        signature: &Signature,
        last_valid_block_height: u64,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ChainError> {
        let mut height_failures = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(ChainError::Cancelled);
            }

            match self.get_signature_status(signature).await {
                Ok(Some(status)) if status.err.is_some() => {
                    return Err(ChainError::TransactionFailed {
                        signature: *signature,
                        reason: status.err.unwrap_or_default(),
                    });
                }
                Ok(Some(status)) if status.is_confirmed() => return Ok(()),
                Ok(_) => {}
                Err(e) => debug!(signature = %signature, error = %e, "Status check failed"),
            }

            match self.get_block_height().await {
                Ok(height) if height > last_valid_block_height => {
                    return Err(ChainError::BlockHeightExceeded {
                        signature: *signature,
                        last_valid_block_height,
                    });
                }
                Ok(_) => height_failures = 0,
                Err(e) => {
                    height_failures += 1;
                    if height_failures >= MAX_HEIGHT_CHECK_FAILURES {
                        warn!(
                            signature = %signature,
                            failures = height_failures,
                            error = %e,
                            "Block height unavailable, giving up on confirmation"
                        );
                        return Err(e);
                    }
                    debug!(signature = %signature, error = %e, "Block height check failed");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(ChainError::Cancelled),
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}
