//! JSON-RPC client for the ledger.
//! Plain `reqwest` + `serde_json`, no SDK client.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use solana_sdk::hash::Hash;
use solana_sdk::signature::Signature;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::error::ChainError;
use crate::transport::{BlockhashInfo, Commitment, RpcTransport, SignatureStatus, TransactionRecord};

/// Default request timeout for RPC calls.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockhashValue {
    blockhash: String,
    last_valid_block_height: u64,
}

#[derive(Deserialize)]
struct ContextWrapped<T> {
    value: T,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusValue {
    slot: u64,
    #[serde(default)]
    confirmation_status: Option<Commitment>,
    #[serde(default)]
    err: Option<Value>,
}

impl From<StatusValue> for SignatureStatus {
    fn from(s: StatusValue) -> Self {
        SignatureStatus {
            slot: s.slot,
            confirmation_status: s.confirmation_status,
            err: s.err.filter(|e| !e.is_null()).map(|e| e.to_string()),
        }
    }
}

/// JSON-RPC client bound to a single endpoint and commitment.
#[derive(Debug)]
pub struct RpcClient {
    http: reqwest::Client,
    url: String,
    commitment: Commitment,
    request_id: AtomicU64,
}

impl RpcClient {
    /// Create a client with the default request timeout.
    pub fn new(url: impl Into<String>, commitment: Commitment) -> Result<Self, ChainError> {
        Self::with_timeout(url, commitment, DEFAULT_TIMEOUT)
    }

    /// Create a client with a custom request timeout.
    pub fn with_timeout(
        url: impl Into<String>,
        commitment: Commitment,
        timeout: Duration,
    ) -> Result<Self, ChainError> {
        let url = url.into();
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        info!(url = %url, commitment = %commitment, "RPC client initialized");

        Ok(Self {
            http,
            url,
            commitment,
            request_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn commitment(&self) -> Commitment {
        self.commitment
    }

    /// Issue a JSON-RPC call and decode its `result` field.
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, ChainError> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        let body: RpcResponse = response.json().await?;

        if let Some(error) = body.error {
            return Err(ChainError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        serde_json::from_value(body.result.unwrap_or(Value::Null))
            .map_err(|e| ChainError::Decode(format!("{method}: {e}")))
    }

    /// Block height round trip; startup aborts when it fails.
    pub async fn health_check(&self) -> Result<u64, ChainError> {
        let height = self.get_block_height().await?;
        debug!(block_height = height, "RPC health check passed");
        Ok(height)
    }
}

#[async_trait]
impl RpcTransport for RpcClient {
    async fn get_latest_blockhash(&self) -> Result<BlockhashInfo, ChainError> {
        let wrapped: ContextWrapped<BlockhashValue> = self
            .call(
                "getLatestBlockhash",
                json!([{ "commitment": self.commitment.as_str() }]),
            )
            .await?;

        let blockhash = Hash::from_str(&wrapped.value.blockhash)
            .map_err(|e| ChainError::Decode(format!("blockhash: {e}")))?;

        Ok(BlockhashInfo {
            blockhash,
            last_valid_block_height: wrapped.value.last_valid_block_height,
        })
    }

    async fn get_block_height(&self) -> Result<u64, ChainError> {
        self.call(
            "getBlockHeight",
            json!([{ "commitment": self.commitment.as_str() }]),
        )
        .await
    }

    #[instrument(skip(self, wire), fields(bytes = wire.len()))]
    async fn send_raw_transaction(
        &self,
        wire: &[u8],
        skip_preflight: bool,
    ) -> Result<Signature, ChainError> {
        let encoded = BASE64_STANDARD.encode(wire);
        let signature: String = self
            .call(
                "sendTransaction",
                json!([
                    encoded,
                    {
                        "encoding": "base64",
                        "skipPreflight": skip_preflight,
                        "preflightCommitment": self.commitment.as_str(),
                    }
                ]),
            )
            .await?;

        Signature::from_str(&signature).map_err(|e| ChainError::Decode(format!("signature: {e}")))
    }

    async fn get_signature_status(
        &self,
        signature: &Signature,
    ) -> Result<Option<SignatureStatus>, ChainError> {
        let wrapped: ContextWrapped<Vec<Option<StatusValue>>> = self
            .call(
                "getSignatureStatuses",
                json!([[signature.to_string()], { "searchTransactionHistory": false }]),
            )
            .await?;

        Ok(wrapped.value.into_iter().next().flatten().map(SignatureStatus::from))
    }

    async fn get_transaction(
        &self,
        signature: &Signature,
    ) -> Result<Option<TransactionRecord>, ChainError> {
        self.call(
            "getTransaction",
            json!([
                signature.to_string(),
                {
                    "commitment": "confirmed",
                    "encoding": "json",
                    "maxSupportedTransactionVersion": 0,
                }
            ]),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_value_decoding() {
        let raw = json!({
            "context": { "slot": 82 },
            "value": [
                {
                    "slot": 72,
                    "confirmations": 10,
                    "err": null,
                    "confirmationStatus": "confirmed"
                }
            ]
        });
        let wrapped: ContextWrapped<Vec<Option<StatusValue>>> = serde_json::from_value(raw).unwrap();
        let status = wrapped.value.into_iter().next().flatten().unwrap();
        assert_eq!(status.slot, 72);
        assert_eq!(status.confirmation_status, Some(Commitment::Confirmed));
        assert!(status.err.is_none());
        assert!(SignatureStatus::from(status).err.is_none());
    }

    #[test]
    fn test_failed_status_keeps_error() {
        let raw = json!({
            "context": { "slot": 82 },
            "value": [
                {
                    "slot": 73,
                    "err": { "InstructionError": [0, { "Custom": 6001 }] },
                    "confirmationStatus": "processed"
                }
            ]
        });
        let wrapped: ContextWrapped<Vec<Option<StatusValue>>> = serde_json::from_value(raw).unwrap();
        let status = SignatureStatus::from(wrapped.value.into_iter().next().flatten().unwrap());
        assert_eq!(status.slot, 73);
        assert!(!status.is_confirmed());
        assert!(status.err.unwrap().contains("6001"));
    }

    #[tokio::test]
    async fn test_health_check_fails_on_closed_port() {
        let client = RpcClient::with_timeout(
            "http://127.0.0.1:1",
            Commitment::Confirmed,
            Duration::from_millis(500),
        )
        .unwrap();
        assert!(client.health_check().await.is_err());
    }

    #[test]
    fn test_unseen_signature_decoding() {
        let raw = json!({ "context": { "slot": 82 }, "value": [null] });
        let wrapped: ContextWrapped<Vec<Option<StatusValue>>> = serde_json::from_value(raw).unwrap();
        assert!(wrapped.value.into_iter().next().flatten().is_none());
    }

    #[test]
    fn test_blockhash_decoding() {
        let raw = json!({
            "context": { "slot": 2792 },
            "value": {
                "blockhash": "EkSnNWid2cvwEVnVx9aBqawnmiCNiDgp3gUdkDPTKN1N",
                "lastValidBlockHeight": 3090
            }
        });
        let wrapped: ContextWrapped<BlockhashValue> = serde_json::from_value(raw).unwrap();
        assert_eq!(wrapped.value.last_valid_block_height, 3090);
        assert!(Hash::from_str(&wrapped.value.blockhash).is_ok());
    }

    #[test]
    fn test_transaction_record_decoding() {
        let raw = json!({
            "slot": 430,
            "blockTime": 1_700_000_000,
            "meta": { "err": null, "fee": 5000 },
            "transaction": {}
        });
        let record: TransactionRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(record.slot, 430);
        assert_eq!(record.block_time, Some(1_700_000_000));
        assert_eq!(record.meta["fee"], 5000);
    }

    #[tokio::test]
    #[ignore] // Requires network
    async fn test_devnet_blockhash() {
        let client = RpcClient::new("https://api.devnet.solana.com", Commitment::Confirmed).unwrap();
        let info = client.get_latest_blockhash().await.unwrap();
        assert!(info.last_valid_block_height > 0);
    }
}
