//! Tier worker: re-evaluates one window of the ranked list on a fixed cadence.
//!
//! Each tick runs strictly in order:
//!
//! 1. read the store and split it into `before`, `window` and `after`
//! 2. re-fetch the window's accounts and the market context
//! 3. re-evaluate margins and partition into eligible and remaining
//! 4. liquidate the eligible accounts one by one
//! 5. merge the remaining snapshots back between `before` and `after`
//!
//! Confirmed liquidations are dropped from the list. Accounts whose
//! liquidation did not land are merged back with their fresh snapshot so the
//! tier retries them next tick.

use anyhow::Context;
use solana_sdk::pubkey::Pubkey;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::account::{AccountSnapshot, MarginAccount, MarketContext};
use crate::liquidator::{LiquidationError, Liquidator};
use crate::ranked_list::WindowSplit;
use crate::ranker::CandidateRanker;
use crate::source::{load_market_context, ChainSource};
use crate::store::{RankedStore, StoreError, StoreWriteMode};
use crate::tiers::PriorityTier;
use crate::worker::{now_seconds, run_ticks, FailureGuard, WorkerError};

/// Counters from one tier tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Entries in the window at read time
    pub window: usize,
    /// Window accounts no longer returned by the chain
    pub missing: usize,
    /// Accounts whose evaluation failed
    pub failed: usize,
    /// Accounts that became inactive
    pub unused: usize,
    pub eligible: usize,
    /// Liquidations that reached confirmation
    pub liquidated: usize,
    /// Snapshots written back
    pub merged: usize,
    /// Store writes attempted, including rejected optimistic writes
    pub write_attempts: u32,
}

pub struct TierWorker {
    tier: PriorityTier,
    source: Arc<dyn ChainSource>,
    ranker: Arc<CandidateRanker>,
    store: Arc<dyn RankedStore>,
    liquidator: Arc<Liquidator>,
    exchange: Pubkey,
    write_mode: StoreWriteMode,
    max_merge_retries: u32,
    max_consecutive_failures: u32,
}

impl TierWorker {
    pub fn new(
        tier: PriorityTier,
        source: Arc<dyn ChainSource>,
        ranker: Arc<CandidateRanker>,
        store: Arc<dyn RankedStore>,
        liquidator: Arc<Liquidator>,
        exchange: Pubkey,
    ) -> Self {
        Self {
            tier,
            source,
            ranker,
            store,
            liquidator,
            exchange,
            write_mode: StoreWriteMode::LastWriteWins,
            max_merge_retries: 0,
            max_consecutive_failures: 0,
        }
    }

    /// Use optimistic writes, retrying a rejected merge up to `retries` times.
    pub fn with_write_mode(mut self, mode: StoreWriteMode, retries: u32) -> Self {
        self.write_mode = mode;
        self.max_merge_retries = retries;
        self
    }

    pub fn with_max_consecutive_failures(mut self, limit: u32) -> Self {
        self.max_consecutive_failures = limit;
        self
    }

    pub fn tier(&self) -> &PriorityTier {
        &self.tier
    }

    #[instrument(skip(self), fields(tier = self.tier.index, range = %self.tier.range))]
    pub async fn tick(&self) -> Result<TickReport, WorkerError> {
        let started = Instant::now();
        let mut report = TickReport::default();

        // Fetching
        let versioned = self.store.read().await?;
        let WindowSplit { before, window, after } = versioned.list.split_window(self.tier.range);
        report.window = window.len();
        if window.is_empty() {
            debug!(len = versioned.list.len(), "Window empty, nothing to do");
            return Ok(report);
        }

        let addresses: Vec<Pubkey> = window.iter().map(|entry| entry.address).collect();
        let (accounts, context) = self.fetch(&addresses).await.map_err(WorkerError::Fetch)?;
        report.missing = addresses.len() - accounts.len();

        // Evaluating
        let mut eligible = Vec::new();
        let mut remaining = Vec::with_capacity(accounts.len());
        for evaluation in self.ranker.evaluate_all(accounts, &context, now_seconds()).await {
            match evaluation.result {
                Ok(snapshot) if !snapshot.is_used() => report.unused += 1,
                Ok(snapshot) if snapshot.is_eligible() => {
                    eligible.push((evaluation.account, snapshot))
                }
                Ok(snapshot) => remaining.push(snapshot),
                Err(e) => {
                    warn!(account = %evaluation.account.address, error = %e, "Margin evaluation failed, dropping account");
                    report.failed += 1;
                }
            }
        }
        report.eligible = eligible.len();

        // Submitting
        for (account, snapshot) in eligible {
            if self.liquidate(&account, &snapshot, &context).await {
                report.liquidated += 1;
            } else {
                remaining.push(snapshot);
            }
        }

        // Merging
        report.merged = remaining.len();
        report.write_attempts = self
            .merge(versioned.version, &before, &after, &addresses, remaining)
            .await?;

        info!(
            window = report.window,
            eligible = report.eligible,
            liquidated = report.liquidated,
            merged = report.merged,
            dropped = report.missing + report.failed + report.unused,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Tier tick complete"
        );
        Ok(report)
    }

    /// Tick until cancelled, sleeping one poll interval after each tick.
    /// Ticks never overlap.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), WorkerError> {
        info!(
            tier = self.tier.index,
            range = %self.tier.range,
            interval_secs = self.tier.poll_interval.as_secs(),
            "Tier worker started"
        );

        let mut guard = FailureGuard::new(format!("tier-{}", self.tier.index), self.max_consecutive_failures);
        run_ticks(self.tier.poll_interval, &mut guard, &cancel, || self.tick()).await?;

        info!(tier = self.tier.index, "Tier worker stopped");
        Ok(())
    }

    async fn fetch(&self, addresses: &[Pubkey]) -> anyhow::Result<(Vec<MarginAccount>, MarketContext)> {
        let started = Instant::now();
        let accounts: Vec<MarginAccount> = self
            .source
            .get_accounts(addresses)
            .await
            .context("failed to fetch window accounts")?
            .into_iter()
            .flatten()
            .collect();
        let context = load_market_context(self.source.as_ref(), &self.exchange).await?;

        debug!(
            requested = addresses.len(),
            found = accounts.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Fetched window"
        );
        Ok((accounts, context))
    }

    /// Returns true when the liquidation confirmed.
    async fn liquidate(&self, account: &MarginAccount, snapshot: &AccountSnapshot, context: &MarketContext) -> bool {
        info!(
            account = %account.address,
            distance = %snapshot.distance,
            "Account eligible for liquidation"
        );

        match self.liquidator.execute(account, context).await {
            Ok(result) => result.is_success(),
            Err(e @ LiquidationError::InFlight(_)) => {
                debug!(account = %account.address, error = %e, "Skipping account");
                false
            }
            Err(e) if e.is_stale_reference() => {
                warn!(account = %account.address, error = %e, "Market map is stale, retrying next tick");
                false
            }
            Err(e) => {
                error!(account = %account.address, error = %e, "Liquidation failed");
                false
            }
        }
    }

    /// Write the window back. Returns the number of write attempts.
    async fn merge(
        &self,
        version: u64,
        before: &[AccountSnapshot],
        after: &[AccountSnapshot],
        window: &[Pubkey],
        updated: Vec<AccountSnapshot>,
    ) -> Result<u32, WorkerError> {
        if self.write_mode == StoreWriteMode::LastWriteWins {
            self.store.merge_range(None, before, after, updated).await?;
            return Ok(1);
        }

        let mut attempts = 1;
        let mut result = self
            .store
            .merge_range(Some(version), before, after, updated.clone())
            .await;

        // Another writer landed first: drop our window from the fresh list
        // and merge into that instead.
        let owned: HashSet<Pubkey> = window.iter().copied().collect();
        while let Err(StoreError::Stale { expected, actual }) = result {
            if attempts > self.max_merge_retries {
                return Err(StoreError::Stale { expected, actual }.into());
            }
            attempts += 1;
            debug!(expected, actual, attempt = attempts, "Store moved on, retrying merge");

            let fresh = self.store.read().await?;
            let base = fresh.list.without(&owned);
            result = self
                .store
                .merge_range(Some(fresh.version), &base, &[], updated.clone())
                .await;
        }

        result?;
        Ok(attempts)
    }
}
