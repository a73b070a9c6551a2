//! Refresh worker: periodically rebuilds the whole ranked list.

use anyhow::Context;
use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::ranker::{CandidateRanker, RankStats};
use crate::source::{load_market_context, ChainSource};
use crate::store::RankedStore;
use crate::worker::{now_seconds, run_ticks, FailureGuard, WorkerError};

/// Counters from one refresh pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefreshReport {
    pub stats: RankStats,
    pub version: u64,
    pub elapsed: Duration,
}

/// Writes the store, never reads it.
pub struct RefreshWorker {
    source: Arc<dyn ChainSource>,
    ranker: Arc<CandidateRanker>,
    store: Arc<dyn RankedStore>,
    exchange: Pubkey,
    interval: Duration,
    max_consecutive_failures: u32,
}

impl RefreshWorker {
    pub fn new(
        source: Arc<dyn ChainSource>,
        ranker: Arc<CandidateRanker>,
        store: Arc<dyn RankedStore>,
        exchange: Pubkey,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            ranker,
            store,
            exchange,
            interval,
            max_consecutive_failures: 0,
        }
    }

    pub fn with_max_consecutive_failures(mut self, limit: u32) -> Self {
        self.max_consecutive_failures = limit;
        self
    }

    /// Fetch the full account universe, rank it and replace the store.
    #[instrument(skip(self), fields(exchange = %self.exchange))]
    pub async fn tick(&self) -> Result<RefreshReport, WorkerError> {
        let started = Instant::now();

        let context = load_market_context(self.source.as_ref(), &self.exchange)
            .await
            .map_err(WorkerError::Fetch)?;

        let fetch_start = Instant::now();
        let accounts = self
            .source
            .get_all_accounts(&self.exchange)
            .await
            .context("failed to fetch margin accounts")
            .map_err(WorkerError::Fetch)?;
        info!(
            count = accounts.len(),
            elapsed_ms = fetch_start.elapsed().as_millis() as u64,
            "Fetched margin accounts"
        );

        let (list, stats) = self.ranker.rank(accounts, &context, now_seconds()).await;
        let version = self.store.replace_all(list).await?;

        let report = RefreshReport {
            stats,
            version,
            elapsed: started.elapsed(),
        };
        info!(
            active = stats.ranked,
            total = stats.total,
            unused = stats.unused,
            failed = stats.failed,
            version,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Ranked list refreshed"
        );
        Ok(report)
    }

    /// Tick until cancelled, sleeping `interval` after each tick.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), WorkerError> {
        info!(interval_secs = self.interval.as_secs(), "Refresh worker started");

        let mut guard = FailureGuard::new("refresh", self.max_consecutive_failures);
        run_ticks(self.interval, &mut guard, &cancel, || self.tick()).await?;

        info!("Refresh worker stopped");
        Ok(())
    }
}
