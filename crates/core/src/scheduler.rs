//! Scheduler: owns the refresh worker and one tier worker per tier.
//!
//! Workers only meet through the ranked store. A worker that gives up
//! cancels the others and its error is returned from [`Scheduler::run`].

use anyhow::{anyhow, Result};
use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::BotConfig;
use crate::liquidator::Liquidator;
use crate::ranker::CandidateRanker;
use crate::refresh::RefreshWorker;
use crate::source::{ChainSource, RiskEngine};
use crate::store::RankedStore;
use crate::tier_worker::TierWorker;
use crate::worker::WorkerError;

pub struct Scheduler {
    store: Arc<dyn RankedStore>,
    refresh: Arc<RefreshWorker>,
    tiers: Vec<Arc<TierWorker>>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn RankedStore>, refresh: RefreshWorker) -> Self {
        Self {
            store,
            refresh: Arc::new(refresh),
            tiers: Vec::new(),
        }
    }

    pub fn with_tier(mut self, worker: TierWorker) -> Self {
        self.tiers.push(Arc::new(worker));
        self
    }

    /// Wire the refresh worker and the configured tier layout.
    pub fn from_config(
        config: &BotConfig,
        source: Arc<dyn ChainSource>,
        risk: Arc<dyn RiskEngine>,
        store: Arc<dyn RankedStore>,
        liquidator: Arc<Liquidator>,
        exchange: Pubkey,
    ) -> Self {
        let ranker = Arc::new(CandidateRanker::new(risk, config.workers.fetch_concurrency));
        let refresh = RefreshWorker::new(
            source.clone(),
            ranker.clone(),
            store.clone(),
            exchange,
            config.refresh.interval(),
        )
        .with_max_consecutive_failures(config.workers.max_consecutive_failures);

        config
            .tier_layout()
            .tiers()
            .iter()
            .fold(Self::new(store.clone(), refresh), |scheduler, tier| {
                scheduler.with_tier(
                    TierWorker::new(
                        *tier,
                        source.clone(),
                        ranker.clone(),
                        store.clone(),
                        liquidator.clone(),
                        exchange,
                    )
                    .with_write_mode(config.store.write_mode, config.store.max_merge_retries)
                    .with_max_consecutive_failures(config.workers.max_consecutive_failures),
                )
            })
    }

    pub fn tier_count(&self) -> usize {
        self.tiers.len()
    }

    /// Clear the store, then run every worker until `cancel` fires or one
    /// of them fails.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.store.clear().await?;
        info!(tiers = self.tiers.len(), "Cleared ranked store, starting workers");

        let mut tasks: JoinSet<(String, Result<(), WorkerError>)> = JoinSet::new();

        let refresh = self.refresh.clone();
        let token = cancel.child_token();
        tasks.spawn(async move { ("refresh".to_string(), refresh.run(token).await) });

        for worker in &self.tiers {
            let worker = worker.clone();
            let token = cancel.child_token();
            let name = format!("tier-{}", worker.tier().index);
            tasks.spawn(async move { (name, worker.run(token).await) });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let failure = match joined {
                Ok((_, Ok(()))) => None,
                Ok((name, Err(e))) => Some(anyhow!(e).context(format!("{name} worker failed"))),
                Err(e) => Some(anyhow!(e).context("worker task panicked")),
            };

            if let Some(e) = failure {
                error!(error = %format!("{e:#}"), "Worker stopped, shutting down");
                cancel.cancel();
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("All workers stopped");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::Fixed;
    use crate::store::MemoryRankedStore;
    use crate::testing::{fast_submitter_config, MockChain, MockEncoder, TableRiskEngine};
    use liquidator_chain::TransactionSubmitter;
    use solana_sdk::signature::Keypair;
    use std::time::Duration;

    fn scheduler(chain: &Arc<MockChain>, risk: Arc<TableRiskEngine>, store: Arc<MemoryRankedStore>, config: &BotConfig) -> Scheduler {
        let submitter = Arc::new(TransactionSubmitter::new(chain.clone(), fast_submitter_config()));
        let liquidator = Arc::new(Liquidator::new(
            Arc::new(MockEncoder::new()),
            submitter,
            Arc::new(Keypair::new()),
            Pubkey::new_unique(),
        ));
        Scheduler::from_config(config, chain.clone(), risk, store, liquidator, chain.exchange_address())
    }

    #[tokio::test]
    async fn test_builds_one_worker_per_tier() {
        let chain = Arc::new(MockChain::new());
        let config = BotConfig::testing();
        let s = scheduler(&chain, Arc::new(TableRiskEngine::new()), Arc::new(MemoryRankedStore::new()), &config);
        assert_eq!(s.tier_count(), 3);
    }

    #[tokio::test]
    async fn test_run_refreshes_and_liquidates_until_cancelled() {
        let chain = Arc::new(MockChain::new());
        let risk = Arc::new(TableRiskEngine::strict());
        let doomed = chain.add_account();
        risk.set_distance(doomed.address, -3);
        for d in [1, 2, 3] {
            let account = chain.add_account();
            risk.set_distance(account.address, d);
        }

        let store = Arc::new(MemoryRankedStore::new());
        let mut config = BotConfig::testing();
        config.tiers.count = 1;
        config.tiers.base_interval_secs = 1;
        let s = Arc::new(scheduler(&chain, risk, store.clone(), &config));

        let cancel = CancellationToken::new();
        let handle = {
            let s = s.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { s.run(cancel).await })
        };

        // The first ticks fire immediately; the tier may run before the
        // refresh has filled the store, so allow for its second tick.
        let mut liquidated = false;
        for _ in 0..300 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let list = store.snapshot();
            if list.len() == 3 && !list.contains(&doomed.address) {
                liquidated = true;
                break;
            }
        }
        cancel.cancel();

        assert!(handle.await.unwrap().is_ok());
        assert!(liquidated);
        assert!(chain.sent_count() >= 1);
        assert!(store.snapshot().iter().all(|e| e.distance > Fixed::ZERO));
    }

    #[tokio::test]
    async fn test_failing_worker_stops_the_rest() {
        let chain = Arc::new(MockChain::new());
        chain.fail_fetches(true);
        let mut config = BotConfig::testing();
        config.workers.max_consecutive_failures = 1;

        let s = scheduler(&chain, Arc::new(TableRiskEngine::new()), Arc::new(MemoryRankedStore::new()), &config);
        let err = tokio::time::timeout(Duration::from_secs(5), s.run(CancellationToken::new()))
            .await
            .unwrap()
            .unwrap_err();
        assert!(format!("{err:#}").contains("refresh worker failed"));
    }
}
