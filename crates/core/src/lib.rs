//! Liquidator core logic.
//!
//! This crate provides the tiered liquidation scheduler:
//! - Candidate ranking by distance to liquidation
//! - Shared ranked store with last-write-wins or optimistic merges
//! - Geometric tier layout and the per-tier worker
//! - Refresh worker rebuilding the full list
//! - Liquidation executor on top of the transaction submitter
//!
//! Chain data, margin computation and instruction encoding are reached
//! through the traits in [`source`].

mod account;
pub mod config;
mod fixed;
mod liquidator;
mod ranked_list;
mod ranker;
mod refresh;
mod scheduler;
pub mod source;
mod store;
mod tier_worker;
mod tiers;
mod worker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use account::{
    pubkey_str, AccountSnapshot, Exchange, MarginAccount, MarginResult, Market, MarketContext,
    MarketSlot, Position, PriceFeed,
};
pub use config::BotConfig;
pub use fixed::{Fixed, FRAC_BITS};
pub use liquidator::{LiquidationError, LiquidationResult, Liquidator};
pub use ranked_list::{RankedList, WindowSplit};
pub use ranker::{CandidateRanker, Evaluation, RankStats};
pub use refresh::{RefreshReport, RefreshWorker};
pub use scheduler::Scheduler;
pub use source::{
    load_market_context, ChainSource, LiquidateAccounts, LiquidateParams, RiskEngine,
    TransactionEncoder,
};
pub use store::{
    MemoryRankedStore, RankedStore, RedisRankedStore, StoreBackend, StoreError, StoreWriteMode,
    Versioned,
};
pub use tier_worker::{TickReport, TierWorker};
pub use tiers::{PriorityTier, TierLayout, WorkerRange, MAX_TIERS};
pub use worker::{now_seconds, FailureGuard, WorkerError};
