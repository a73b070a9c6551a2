//! Liquidation executor: resolve markets, build, submit.

use dashmap::DashMap;
use liquidator_chain::{ChainError, SubmissionOutcome, SubmitError, TransactionSubmitter};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::account::{MarginAccount, Market, MarketContext, PriceFeed};
use crate::source::{LiquidateAccounts, LiquidateParams, TransactionEncoder};

#[derive(Debug, Error)]
pub enum LiquidationError {
    #[error("market {market_id} is missing from the market map")]
    MissingMarket { market_id: u32 },

    #[error("price feed {feed} for market {market_id} is missing")]
    MissingPriceFeed { market_id: u32, feed: Pubkey },

    #[error("liquidation of {0} already in flight")]
    InFlight(Pubkey),

    #[error("failed to fetch blockhash: {0}")]
    Blockhash(#[source] ChainError),

    #[error("failed to build liquidation: {0:#}")]
    Encode(anyhow::Error),

    #[error(transparent)]
    Submit(#[from] SubmitError),
}

impl LiquidationError {
    /// Errors caused by a market map that lags the account's positions.
    pub fn is_stale_reference(&self) -> bool {
        matches!(
            self,
            LiquidationError::MissingMarket { .. } | LiquidationError::MissingPriceFeed { .. }
        )
    }
}

/// Result of one executed liquidation.
#[derive(Debug, Clone)]
pub struct LiquidationResult {
    pub account: Pubkey,
    pub outcome: SubmissionOutcome,
    pub elapsed: Duration,
}

impl LiquidationResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_confirmed()
    }
}

/// Liquidation executor.
pub struct Liquidator {
    /// Instruction encoder
    encoder: Arc<dyn TransactionEncoder>,

    /// Send/confirm state machine
    submitter: Arc<TransactionSubmitter>,

    /// Liquidator signer, also the fee payer
    signer: Arc<Keypair>,

    /// Margin account receiving the liquidated positions
    liquidator_margin_account: Pubkey,

    /// Extra protocol parameters forwarded to the encoder
    params: Option<LiquidateParams>,

    /// Accounts with a submission in progress
    in_flight: DashMap<Pubkey, Instant>,
}

impl Liquidator {
    pub fn new(
        encoder: Arc<dyn TransactionEncoder>,
        submitter: Arc<TransactionSubmitter>,
        signer: Arc<Keypair>,
        liquidator_margin_account: Pubkey,
    ) -> Self {
        Self {
            encoder,
            submitter,
            signer,
            liquidator_margin_account,
            params: None,
            in_flight: DashMap::new(),
        }
    }

    /// Set liquidation parameters passed to every encoder call.
    pub fn with_params(mut self, params: LiquidateParams) -> Self {
        self.params = Some(params);
        self
    }

    pub fn liquidator(&self) -> Pubkey {
        self.signer.pubkey()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Markets and price feeds referenced by the account's positions, in
    /// position order.
    pub fn resolve_markets(
        account: &MarginAccount,
        context: &MarketContext,
    ) -> Result<(Vec<Market>, Vec<PriceFeed>), LiquidationError> {
        let mut markets = Vec::with_capacity(account.positions.len());
        let mut feeds = Vec::with_capacity(account.positions.len());

        for position in &account.positions {
            let market = context
                .market(position.market_id)
                .ok_or(LiquidationError::MissingMarket {
                    market_id: position.market_id,
                })?;
            let feed = context
                .price_feed(&market.price_feed)
                .ok_or(LiquidationError::MissingPriceFeed {
                    market_id: position.market_id,
                    feed: market.price_feed,
                })?;
            markets.push(market.clone());
            feeds.push(feed.clone());
        }

        Ok((markets, feeds))
    }

    /// Liquidate one account with a fresh blockhash.
    ///
    /// An account already being liquidated by another tier is rejected with
    /// [`LiquidationError::InFlight`] instead of sending a duplicate.
    #[instrument(skip(self, account, context), fields(account = %account.address))]
    pub async fn execute(
        &self,
        account: &MarginAccount,
        context: &MarketContext,
    ) -> Result<LiquidationResult, LiquidationError> {
        let started = Instant::now();

        let (markets, feeds) = Self::resolve_markets(account, context)?;

        if self.in_flight.insert(account.address, started).is_some() {
            return Err(LiquidationError::InFlight(account.address));
        }
        let _claim = InFlightClaim {
            map: &self.in_flight,
            account: account.address,
        };

        let outcome = self.build_and_submit(account, &markets, &feeds).await?;
        let elapsed = started.elapsed();
        match &outcome {
            SubmissionOutcome::Confirmed { signature, record } => info!(
                account = %account.address,
                signature = %signature,
                record = record.is_some(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Liquidation confirmed"
            ),
            SubmissionOutcome::Expired { signature } => warn!(
                account = %account.address,
                signature = %signature,
                elapsed_ms = elapsed.as_millis() as u64,
                "Liquidation expired, will retry with a fresh blockhash"
            ),
        }

        Ok(LiquidationResult {
            account: account.address,
            outcome,
            elapsed,
        })
    }

    async fn build_and_submit(
        &self,
        account: &MarginAccount,
        markets: &[Market],
        feeds: &[PriceFeed],
    ) -> Result<SubmissionOutcome, LiquidationError> {
        let blockhash = self
            .submitter
            .transport()
            .get_latest_blockhash()
            .await
            .map_err(LiquidationError::Blockhash)?;

        let accounts = LiquidateAccounts {
            margin_account: account.address,
            exchange: account.exchange,
            owner: account.owner,
            liquidator: self.signer.pubkey(),
            liquidator_margin_account: self.liquidator_margin_account,
        };

        let encode_start = Instant::now();
        let tx = self
            .encoder
            .build_liquidation(&accounts, markets, feeds, self.params.as_ref(), self.signer.pubkey())
            .await
            .map_err(LiquidationError::Encode)?;

        debug!(
            account = %account.address,
            markets = markets.len(),
            instructions = tx.instructions().len(),
            encode_ms = encode_start.elapsed().as_millis() as u64,
            "Built liquidation transaction"
        );

        let outcome = self
            .submitter
            .submit(tx, &blockhash, std::slice::from_ref(&self.signer))
            .await?;
        Ok(outcome)
    }
}

/// Releases the in-flight entry when the submission ends or is dropped.
struct InFlightClaim<'a> {
    map: &'a DashMap<Pubkey, Instant>,
    account: Pubkey,
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.account);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_submitter_config, MockChain, MockEncoder};

    fn liquidator(chain: &Arc<MockChain>, encoder: Arc<MockEncoder>) -> Liquidator {
        let submitter = TransactionSubmitter::new(chain.clone(), fast_submitter_config());
        Liquidator::new(encoder, Arc::new(submitter), Arc::new(Keypair::new()), Pubkey::new_unique())
    }

    #[tokio::test]
    async fn test_execute_confirms() {
        let chain = Arc::new(MockChain::new());
        let market = chain.add_market(1);
        let account = chain.add_account_with_positions(&[market.id]);
        let encoder = Arc::new(MockEncoder::new());
        let liquidator = liquidator(&chain, encoder.clone());

        let result = liquidator.execute(&account, &chain.context()).await.unwrap();
        assert!(result.is_success());
        assert_eq!(encoder.built_for(), vec![account.address]);
        assert_eq!(liquidator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_execute_waits_for_status_polls() {
        let chain = Arc::new(MockChain::new());
        chain.confirm_after_polls(3);
        let account = chain.add_account();
        let liquidator = liquidator(&chain, Arc::new(MockEncoder::new()));

        let result = liquidator.execute(&account, &chain.context()).await.unwrap();
        assert!(result.outcome.is_confirmed());
        assert!(chain.sent_count() >= 1);
        assert_eq!(liquidator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_market_is_stale_reference() {
        let chain = Arc::new(MockChain::new());
        let account = chain.add_account_with_positions(&[42]);
        let encoder = Arc::new(MockEncoder::new());
        let liquidator = liquidator(&chain, encoder.clone());

        let err = liquidator.execute(&account, &chain.context()).await.unwrap_err();
        assert!(matches!(err, LiquidationError::MissingMarket { market_id: 42 }));
        assert!(err.is_stale_reference());
        assert!(encoder.built_for().is_empty());
        assert_eq!(chain.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_resolve_markets_follows_positions() {
        let chain = MockChain::new();
        let a = chain.add_market(1);
        let b = chain.add_market(2);
        let account = chain.add_account_with_positions(&[2, 1]);

        let (markets, feeds) = Liquidator::resolve_markets(&account, &chain.context()).unwrap();
        assert_eq!(markets.iter().map(|m| m.id).collect::<Vec<_>>(), vec![2, 1]);
        assert_eq!(feeds[0].address, b.price_feed);
        assert_eq!(feeds[1].address, a.price_feed);
    }

    #[tokio::test]
    async fn test_encoder_failure_surfaces() {
        let chain = Arc::new(MockChain::new());
        let account = chain.add_account();
        let encoder = Arc::new(MockEncoder::new());
        encoder.fail_for(account.address);
        let liquidator = liquidator(&chain, encoder);

        let err = liquidator.execute(&account, &chain.context()).await.unwrap_err();
        assert!(matches!(err, LiquidationError::Encode(_)));
        assert_eq!(liquidator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_submission_is_not_an_error() {
        let chain = Arc::new(MockChain::new());
        chain.never_confirm();
        chain.expire_after_blocks(1);
        let account = chain.add_account();
        let liquidator = liquidator(&chain, Arc::new(MockEncoder::new()));

        let result = liquidator.execute(&account, &chain.context()).await.unwrap();
        assert!(matches!(result.outcome, SubmissionOutcome::Expired { .. }));
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn test_second_claim_is_rejected() {
        let chain = Arc::new(MockChain::new());
        let account = chain.add_account();
        let liquidator = liquidator(&chain, Arc::new(MockEncoder::new()));
        liquidator.in_flight.insert(account.address, Instant::now());

        let err = liquidator.execute(&account, &chain.context()).await.unwrap_err();
        assert!(matches!(err, LiquidationError::InFlight(addr) if addr == account.address));
        assert_eq!(chain.sent_count(), 0);
    }
}
