//! Liquidator chain interaction layer.
//!
//! This crate provides:
//! - JSON-RPC transport for blockhashes, broadcasts, signature status and records
//! - Transaction assembly with a compute-unit priority fee and signing
//! - The submitter state machine (send, resend, confirmation race, record lookup)

mod error;
mod rpc;
mod sender;
mod transaction;
mod transport;

pub use error::ChainError;
pub use rpc::RpcClient;
pub use sender::{SubmissionOutcome, SubmitError, SubmitterConfig, TransactionSubmitter};
pub use transaction::{SignedTransaction, SigningError, UnsignedTransaction};
pub use transport::{
    BlockhashInfo, Commitment, RpcTransport, SignatureStatus, TransactionRecord,
};
