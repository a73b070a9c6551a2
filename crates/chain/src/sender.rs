//! Transaction submitter: send once, resend on a fixed cadence, race two
//! confirmation watchers, then look up the landed record.
//!
//! Lifecycle of one [`TransactionSubmitter::submit`] call:
//!
//! 1. append the priority fee, sign, broadcast once with preflight skipped
//! 2. spawn the resender, which re-broadcasts the same bytes until cancelled
//! 3. race the block-height bounded confirmation wait against a status poll
//! 4. cancel the resender and wait for it to exit
//! 5. on confirmation, fetch the transaction record with bounded backoff

use solana_sdk::signature::{Keypair, Signature};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::ChainError;
use crate::transaction::{SigningError, UnsignedTransaction};
use crate::transport::{BlockhashInfo, RpcTransport, TransactionRecord};

/// Submitter timing and fee parameters.
#[derive(Debug, Clone)]
pub struct SubmitterConfig {
    /// Priority fee in micro-lamports per compute unit
    pub compute_unit_price: u64,
    /// Re-broadcast cadence
    pub resend_interval: Duration,
    /// Status poll cadence of the manual watcher
    pub status_poll_interval: Duration,
    /// Poll cadence of the block-height bounded watcher
    pub confirm_poll_interval: Duration,
    /// Blocks subtracted from `last_valid_block_height` before giving up
    pub expiry_margin_blocks: u64,
    /// Record lookup attempts after confirmation
    pub lookup_attempts: u32,
    /// Delay before the second lookup attempt
    pub lookup_min_backoff: Duration,
    /// Multiplier applied to the lookup delay after each miss
    pub lookup_backoff_factor: f64,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            compute_unit_price: 10_000,
            resend_interval: Duration::from_secs(2),
            status_poll_interval: Duration::from_secs(2),
            confirm_poll_interval: Duration::from_secs(1),
            expiry_margin_blocks: 150,
            lookup_attempts: 5,
            lookup_min_backoff: Duration::from_secs(1),
            lookup_backoff_factor: 2.0,
        }
    }
}

/// Terminal, non-error outcome of a submission.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionOutcome {
    /// Signature observed at `confirmed`. `record` is `None` when the lookup
    /// kept missing after all attempts.
    Confirmed {
        signature: Signature,
        record: Option<TransactionRecord>,
    },
    /// Blockhash validity window passed before confirmation.
    Expired { signature: Signature },
}

impl SubmissionOutcome {
    pub fn signature(&self) -> &Signature {
        match self {
            SubmissionOutcome::Confirmed { signature, .. } => signature,
            SubmissionOutcome::Expired { signature } => signature,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, SubmissionOutcome::Confirmed { .. })
    }
}

/// Submission failures.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error("initial send failed: {0}")]
    Send(#[source] ChainError),

    #[error("transaction {signature} failed on chain: {reason}")]
    Failed { signature: Signature, reason: String },

    #[error("confirmation of {signature} failed: {source}")]
    Confirmation {
        signature: Signature,
        #[source]
        source: ChainError,
    },
}

/// Drives one transaction from first broadcast to a terminal outcome.
pub struct TransactionSubmitter {
    transport: Arc<dyn RpcTransport>,
    config: SubmitterConfig,
}

impl TransactionSubmitter {
    pub fn new(transport: Arc<dyn RpcTransport>, config: SubmitterConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &SubmitterConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn RpcTransport> {
        &self.transport
    }

    /// Sign, send and track `transaction` until it confirms or expires.
    #[instrument(skip_all, fields(blockhash = %blockhash.blockhash))]
    pub async fn submit(
        &self,
        transaction: UnsignedTransaction,
        blockhash: &BlockhashInfo,
        signers: &[Arc<Keypair>],
    ) -> Result<SubmissionOutcome, SubmitError> {
        let started = Instant::now();

        let signed = transaction
            .with_compute_unit_price(self.config.compute_unit_price)
            .sign(signers, blockhash.blockhash)?;

        let signature = self
            .transport
            .send_raw_transaction(&signed.wire, true)
            .await
            .map_err(SubmitError::Send)?;
        if signature != signed.signature {
            warn!(
                expected = %signed.signature,
                returned = %signature,
                "RPC returned a different signature than the signed one"
            );
        }

        info!(
            signature = %signature,
            send_ms = started.elapsed().as_millis() as u64,
            "Transaction sent, waiting for confirmation"
        );

        let cancel = CancellationToken::new();
        // Cancels on every exit path, including this future being dropped.
        let guard = cancel.clone().drop_guard();
        let resender = self.spawn_resender(signed.wire.clone(), cancel.clone());

        let expiry_height = blockhash
            .last_valid_block_height
            .saturating_sub(self.config.expiry_margin_blocks);
        let race = self.wait_for_confirmation(&signature, expiry_height, &cancel).await;

        drop(guard);
        let resends = resender.await.unwrap_or_else(|e| {
            warn!(error = %e, "Resender task panicked");
            0
        });

        match race {
            Ok(()) => {}
            Err(ChainError::BlockHeightExceeded { .. }) => {
                info!(
                    signature = %signature,
                    resends,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Transaction expired before confirmation"
                );
                return Ok(SubmissionOutcome::Expired { signature });
            }
            Err(ChainError::TransactionFailed { reason, .. }) => {
                return Err(SubmitError::Failed { signature, reason });
            }
            Err(source) => return Err(SubmitError::Confirmation { signature, source }),
        }

        info!(
            signature = %signature,
            resends,
            confirm_ms = started.elapsed().as_millis() as u64,
            "Transaction confirmed"
        );

        let record = self.lookup_transaction(&signature).await;
        Ok(SubmissionOutcome::Confirmed { signature, record })
    }

    /// Re-broadcast `wire` every `resend_interval` until `cancel` fires.
    /// Returns the number of re-broadcast attempts.
    fn spawn_resender(&self, wire: Arc<[u8]>, cancel: CancellationToken) -> JoinHandle<u32> {
        let transport = self.transport.clone();
        let interval = self.config.resend_interval;

        tokio::spawn(async move {
            let mut attempts = 0u32;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return attempts,
                    _ = tokio::time::sleep(interval) => {}
                }
                if cancel.is_cancelled() {
                    return attempts;
                }
                attempts += 1;
                if let Err(e) = transport.send_raw_transaction(&wire, true).await {
                    warn!(attempt = attempts, error = %e, "Failed to resend transaction");
                }
            }
        })
    }

    /// Race the block-height bounded wait against the manual status poll.
    async fn wait_for_confirmation(
        &self,
        signature: &Signature,
        expiry_height: u64,
        cancel: &CancellationToken,
    ) -> Result<(), ChainError> {
        tokio::select! {
            result = self.transport.confirm_transaction(
                signature,
                expiry_height,
                self.config.confirm_poll_interval,
                cancel,
            ) => result,
            result = self.poll_signature_status(signature, cancel) => result,
        }
    }

    /// Query the signature status on a fixed cadence until it reports
    /// `confirmed` (or better).
    async fn poll_signature_status(
        &self,
        signature: &Signature,
        cancel: &CancellationToken,
    ) -> Result<(), ChainError> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ChainError::Cancelled),
                _ = tokio::time::sleep(self.config.status_poll_interval) => {}
            }

            match self.transport.get_signature_status(signature).await {
                Ok(Some(status)) if status.err.is_some() => {
                    return Err(ChainError::TransactionFailed {
                        signature: *signature,
                        reason: status.err.unwrap_or_default(),
                    });
                }
                Ok(Some(status)) if status.is_confirmed() => {
                    debug!(signature = %signature, slot = status.slot, "Status poll saw confirmation");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => debug!(signature = %signature, error = %e, "Status poll failed"),
            }
        }
    }

    /// Fetch the landed record, retrying to cover read-replica lag.
    async fn lookup_transaction(&self, signature: &Signature) -> Option<TransactionRecord> {
        let mut delay = self.config.lookup_min_backoff;

        for attempt in 1..=self.config.lookup_attempts {
            match self.transport.get_transaction(signature).await {
                Ok(Some(record)) => {
                    debug!(signature = %signature, attempt, slot = record.slot, "Transaction record found");
                    return Some(record);
                }
                Ok(None) => debug!(signature = %signature, attempt, "Transaction record not indexed yet"),
                Err(e) => debug!(signature = %signature, attempt, error = %e, "Transaction lookup failed"),
            }

            if attempt < self.config.lookup_attempts {
                tokio::time::sleep(delay).await;
                delay = delay.mul_f64(self.config.lookup_backoff_factor.max(1.0));
            }
        }

        warn!(
            signature = %signature,
            attempts = self.config.lookup_attempts,
            "Confirmed transaction record not found after retries"
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Commitment, SignatureStatus};
    use async_trait::async_trait;
    use solana_sdk::hash::Hash;
    use solana_sdk::instruction::{AccountMeta, Instruction};
    use solana_sdk::pubkey::Pubkey;
    use solana_sdk::signer::Signer;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted chain: confirms after `confirm_after` status polls, or expires
    /// immediately when `expire` is set.
    #[derive(Default)]
    struct ScriptedChain {
        confirm_after: u32,
        expire: bool,
        record_after: Option<u32>,
        sends: AtomicU32,
        status_calls: AtomicU32,
        lookups: AtomicU32,
    }

    #[async_trait]
    impl RpcTransport for ScriptedChain {
        async fn get_latest_blockhash(&self) -> Result<BlockhashInfo, ChainError> {
            Ok(BlockhashInfo {
                blockhash: Hash::new_unique(),
                last_valid_block_height: 1_000,
            })
        }

        async fn get_block_height(&self) -> Result<u64, ChainError> {
            Ok(10)
        }

        async fn send_raw_transaction(
            &self,
            wire: &[u8],
            _skip_preflight: bool,
        ) -> Result<Signature, ChainError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            let tx: solana_sdk::transaction::Transaction = bincode::deserialize(wire)
                .map_err(|e| ChainError::Decode(e.to_string()))?;
            Ok(tx.signatures[0])
        }

        async fn get_signature_status(
            &self,
            _signature: &Signature,
        ) -> Result<Option<SignatureStatus>, ChainError> {
            let n = self.status_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.confirm_after && !self.expire {
                Ok(Some(SignatureStatus {
                    slot: 42,
                    confirmation_status: Some(Commitment::Confirmed),
                    err: None,
                }))
            } else {
                Ok(None)
            }
        }

        async fn get_transaction(
            &self,
            _signature: &Signature,
        ) -> Result<Option<TransactionRecord>, ChainError> {
            let n = self.lookups.fetch_add(1, Ordering::SeqCst) + 1;
            match self.record_after {
                Some(after) if n >= after => Ok(Some(TransactionRecord {
                    slot: 42,
                    block_time: None,
                    meta: serde_json::Value::Null,
                })),
                _ => Ok(None),
            }
        }

        // Stands in for a subscription: never resolves on its own unless the
        // script says the blockhash expired.
        async fn confirm_transaction(
            &self,
            signature: &Signature,
            last_valid_block_height: u64,
            _poll_interval: Duration,
            cancel: &CancellationToken,
        ) -> Result<(), ChainError> {
            if self.expire {
                return Err(ChainError::BlockHeightExceeded {
                    signature: *signature,
                    last_valid_block_height,
                });
            }
            cancel.cancelled().await;
            Err(ChainError::Cancelled)
        }
    }

    /// Accepts the first broadcast, then fails every call.
    #[derive(Default)]
    struct UnreachableChain {
        sends: AtomicU32,
    }

    #[async_trait]
    impl RpcTransport for UnreachableChain {
        async fn get_latest_blockhash(&self) -> Result<BlockhashInfo, ChainError> {
            Err(ChainError::Decode("node unreachable".into()))
        }

        async fn get_block_height(&self) -> Result<u64, ChainError> {
            Err(ChainError::Decode("node unreachable".into()))
        }

        async fn send_raw_transaction(
            &self,
            wire: &[u8],
            _skip_preflight: bool,
        ) -> Result<Signature, ChainError> {
            if self.sends.fetch_add(1, Ordering::SeqCst) > 0 {
                return Err(ChainError::Decode("node unreachable".into()));
            }
            let tx: solana_sdk::transaction::Transaction = bincode::deserialize(wire)
                .map_err(|e| ChainError::Decode(e.to_string()))?;
            Ok(tx.signatures[0])
        }

        async fn get_signature_status(
            &self,
            _signature: &Signature,
        ) -> Result<Option<SignatureStatus>, ChainError> {
            Err(ChainError::Decode("node unreachable".into()))
        }

        async fn get_transaction(
            &self,
            _signature: &Signature,
        ) -> Result<Option<TransactionRecord>, ChainError> {
            Err(ChainError::Decode("node unreachable".into()))
        }
    }

    fn fast_config() -> SubmitterConfig {
        SubmitterConfig {
            compute_unit_price: 10_000,
            resend_interval: Duration::from_millis(20),
            status_poll_interval: Duration::from_millis(20),
            confirm_poll_interval: Duration::from_millis(20),
            expiry_margin_blocks: 150,
            lookup_attempts: 5,
            lookup_min_backoff: Duration::from_millis(5),
            lookup_backoff_factor: 2.0,
        }
    }

    fn liquidation_like(payer: &Keypair) -> UnsignedTransaction {
        UnsignedTransaction::new(
            vec![Instruction::new_with_bytes(
                Pubkey::new_unique(),
                &[7],
                vec![AccountMeta::new(payer.pubkey(), true)],
            )],
            payer.pubkey(),
        )
    }

    fn blockhash() -> BlockhashInfo {
        BlockhashInfo {
            blockhash: Hash::new_unique(),
            last_valid_block_height: 1_000,
        }
    }

    #[tokio::test]
    async fn test_confirmed_after_three_polls_stops_resender() {
        let chain = Arc::new(ScriptedChain {
            confirm_after: 3,
            record_after: Some(1),
            ..Default::default()
        });
        let submitter = TransactionSubmitter::new(chain.clone(), fast_config());
        let payer = Arc::new(Keypair::new());

        let outcome = submitter
            .submit(liquidation_like(&payer), &blockhash(), &[payer.clone()])
            .await
            .unwrap();

        assert!(outcome.is_confirmed());
        assert_eq!(chain.status_calls.load(Ordering::SeqCst), 3);
        match &outcome {
            SubmissionOutcome::Confirmed { record, .. } => assert_eq!(record.as_ref().unwrap().slot, 42),
            other => panic!("unexpected outcome: {other:?}"),
        }

        let sends_at_return = chain.sends.load(Ordering::SeqCst);
        assert!(sends_at_return >= 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(chain.sends.load(Ordering::SeqCst), sends_at_return);
    }

    #[tokio::test]
    async fn test_expired_blockhash_is_not_an_error() {
        let chain = Arc::new(ScriptedChain {
            confirm_after: u32::MAX,
            expire: true,
            ..Default::default()
        });
        let submitter = TransactionSubmitter::new(chain.clone(), fast_config());
        let payer = Arc::new(Keypair::new());

        let outcome = submitter
            .submit(liquidation_like(&payer), &blockhash(), &[payer.clone()])
            .await
            .unwrap();

        assert!(matches!(outcome, SubmissionOutcome::Expired { .. }));
        assert_eq!(chain.lookups.load(Ordering::SeqCst), 0);

        let sends_at_return = chain.sends.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(chain.sends.load(Ordering::SeqCst), sends_at_return);
    }

    #[tokio::test]
    async fn test_missing_record_is_soft_success() {
        let chain = Arc::new(ScriptedChain {
            confirm_after: 1,
            record_after: None,
            ..Default::default()
        });
        let submitter = TransactionSubmitter::new(chain.clone(), fast_config());
        let payer = Arc::new(Keypair::new());

        let outcome = submitter
            .submit(liquidation_like(&payer), &blockhash(), &[payer.clone()])
            .await
            .unwrap();

        match outcome {
            SubmissionOutcome::Confirmed { record, .. } => assert!(record.is_none()),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(chain.lookups.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_record_found_after_lag() {
        let chain = Arc::new(ScriptedChain {
            confirm_after: 1,
            record_after: Some(3),
            ..Default::default()
        });
        let submitter = TransactionSubmitter::new(chain.clone(), fast_config());
        let payer = Arc::new(Keypair::new());

        let outcome = submitter
            .submit(liquidation_like(&payer), &blockhash(), &[payer.clone()])
            .await
            .unwrap();

        assert!(outcome.is_confirmed());
        assert_eq!(chain.lookups.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_default_confirm_strategy_detects_expiry() {
        // Uses the trait's default block-height strategy with a chain that
        // never reports the signature.
        struct Behind;

        #[async_trait]
        impl RpcTransport for Behind {
            async fn get_latest_blockhash(&self) -> Result<BlockhashInfo, ChainError> {
                unimplemented!()
            }
            async fn get_block_height(&self) -> Result<u64, ChainError> {
                Ok(900)
            }
            async fn send_raw_transaction(&self, _: &[u8], _: bool) -> Result<Signature, ChainError> {
                unimplemented!()
            }
            async fn get_signature_status(
                &self,
                _: &Signature,
            ) -> Result<Option<SignatureStatus>, ChainError> {
                Ok(None)
            }
            async fn get_transaction(&self, _: &Signature) -> Result<Option<TransactionRecord>, ChainError> {
                Ok(None)
            }
        }

        let cancel = CancellationToken::new();
        let result = Behind
            .confirm_transaction(&Signature::default(), 850, Duration::from_millis(5), &cancel)
            .await;
        assert!(matches!(result, Err(ChainError::BlockHeightExceeded { last_valid_block_height: 850, .. })));
    }

    #[test]
    fn test_default_config_matches_protocol_constants() {
        let config = SubmitterConfig::default();
        assert_eq!(config.resend_interval, Duration::from_secs(2));
        assert_eq!(config.status_poll_interval, Duration::from_secs(2));
        assert_eq!(config.expiry_margin_blocks, 150);
        assert_eq!(config.lookup_attempts, 5);
        assert_eq!(config.lookup_min_backoff, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_unreachable_chain_ends_submission_and_resends() {
        let chain = Arc::new(UnreachableChain::default());
        let submitter = TransactionSubmitter::new(chain.clone(), fast_config());
        let payer = Arc::new(Keypair::new());

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            submitter.submit(liquidation_like(&payer), &blockhash(), &[payer.clone()]),
        )
        .await
        .expect("submit must give up while the chain is unreachable");
        assert!(matches!(result, Err(SubmitError::Confirmation { .. })));

        let sends_at_return = chain.sends.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(chain.sends.load(Ordering::SeqCst), sends_at_return);
    }
}
