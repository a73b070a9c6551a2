//! Candidate ranking: evaluate margins and order accounts by distance.

use anyhow::Result;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::account::{AccountSnapshot, MarginAccount, MarketContext};
use crate::ranked_list::RankedList;
use crate::source::RiskEngine;

/// Counters from one ranking pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RankStats {
    pub total: usize,
    pub ranked: usize,
    pub unused: usize,
    pub failed: usize,
}

/// Outcome of evaluating one account.
pub struct Evaluation {
    pub account: MarginAccount,
    pub result: Result<AccountSnapshot>,
}

pub struct CandidateRanker {
    risk: Arc<dyn RiskEngine>,
    concurrency: usize,
}

impl CandidateRanker {
    pub fn new(risk: Arc<dyn RiskEngine>, concurrency: usize) -> Self {
        Self {
            risk,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn evaluate(
        &self,
        account: &MarginAccount,
        context: &MarketContext,
        now: i64,
    ) -> Result<AccountSnapshot> {
        let margins = self.risk.compute_margins(account, context, now).await?;
        Ok(AccountSnapshot::new(account.address, margins, now))
    }

    /// Evaluate accounts with bounded concurrency, preserving input order.
    pub async fn evaluate_all(
        &self,
        accounts: Vec<MarginAccount>,
        context: &MarketContext,
        now: i64,
    ) -> Vec<Evaluation> {
        stream::iter(accounts)
            .map(|account| async move {
                let result = self.evaluate(&account, context, now).await;
                Evaluation { account, result }
            })
            .buffered(self.concurrency)
            .collect()
            .await
    }

    /// Rank active accounts ascending by distance.
    ///
    /// Accounts with a zero margin component are not in use and are left
    /// out, as are accounts whose evaluation fails. Neither aborts the pass.
    pub async fn rank(
        &self,
        accounts: Vec<MarginAccount>,
        context: &MarketContext,
        now: i64,
    ) -> (RankedList, RankStats) {
        let mut stats = RankStats {
            total: accounts.len(),
            ..Default::default()
        };

        let mut snapshots = Vec::with_capacity(accounts.len());
        for evaluation in self.evaluate_all(accounts, context, now).await {
            match evaluation.result {
                Ok(snapshot) if snapshot.is_used() => snapshots.push(snapshot),
                Ok(_) => stats.unused += 1,
                Err(e) => {
                    trace!(account = %evaluation.account.address, error = %e, "Skipping account");
                    stats.failed += 1;
                }
            }
        }

        let list = RankedList::from_unsorted(snapshots);
        stats.ranked = list.len();

        debug!(
            total = stats.total,
            ranked = stats.ranked,
            unused = stats.unused,
            failed = stats.failed,
            "Ranked candidates"
        );

        (list, stats)
    }
}
