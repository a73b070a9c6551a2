//! Seams to the external collaborators: chain data, risk engine and encoder.
//!
//! Workers only ever see these traits. The gateway client in `liquidator-api`
//! implements all three; tests use the in-memory doubles from `testing`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use liquidator_chain::{ChainError, UnsignedTransaction};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::debug;

use crate::account::{pubkey_str, Exchange, MarginAccount, MarginResult, Market, MarketContext, PriceFeed};

/// Typed account fetches. Batched lookups return one slot per requested key,
/// `None` where the account does not exist.
#[async_trait]
pub trait ChainSource: Send + Sync {
    async fn get_exchange(&self, address: &Pubkey) -> Result<Option<Exchange>, ChainError>;

    async fn get_markets(&self, addresses: &[Pubkey]) -> Result<Vec<Option<Market>>, ChainError>;

    async fn get_price_feeds(&self, addresses: &[Pubkey]) -> Result<Vec<Option<PriceFeed>>, ChainError>;

    /// Every margin account registered under `exchange`.
    async fn get_all_accounts(&self, exchange: &Pubkey) -> Result<Vec<MarginAccount>, ChainError>;

    async fn get_accounts(&self, addresses: &[Pubkey]) -> Result<Vec<Option<MarginAccount>>, ChainError>;
}

/// Margin computation, treated as a pure function of its inputs.
#[async_trait]
pub trait RiskEngine: Send + Sync {
    /// Fails when a referenced market or price feed is missing from `context`.
    async fn compute_margins(
        &self,
        account: &MarginAccount,
        context: &MarketContext,
        now: i64,
    ) -> Result<MarginResult>;
}

/// Accounts touched by a liquidation instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidateAccounts {
    #[serde(with = "pubkey_str")]
    pub margin_account: Pubkey,
    #[serde(with = "pubkey_str")]
    pub exchange: Pubkey,
    #[serde(with = "pubkey_str")]
    pub owner: Pubkey,
    /// Signer and fee payer
    #[serde(with = "pubkey_str")]
    pub liquidator: Pubkey,
    #[serde(with = "pubkey_str")]
    pub liquidator_margin_account: Pubkey,
}

/// Optional protocol parameters forwarded verbatim to the encoder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LiquidateParams(pub serde_json::Map<String, serde_json::Value>);

#[async_trait]
pub trait TransactionEncoder: Send + Sync {
    async fn build_liquidation(
        &self,
        accounts: &LiquidateAccounts,
        markets: &[Market],
        price_feeds: &[PriceFeed],
        params: Option<&LiquidateParams>,
        fee_payer: Pubkey,
    ) -> Result<UnsignedTransaction>;
}

/// Load the exchange with every listed market and its price feed.
///
/// Missing markets and feeds are skipped; accounts that reference them fail
/// evaluation later instead of failing the whole pass.
pub async fn load_market_context(source: &dyn ChainSource, exchange: &Pubkey) -> Result<MarketContext> {
    let started = Instant::now();

    let exchange = source
        .get_exchange(exchange)
        .await
        .context("failed to fetch exchange")?
        .with_context(|| format!("exchange {exchange} not found"))?;

    let market_addresses = exchange.active_market_addresses();
    let markets: HashMap<u32, Market> = source
        .get_markets(&market_addresses)
        .await
        .context("failed to fetch markets")?
        .into_iter()
        .flatten()
        .map(|market| (market.id, market))
        .collect();

    let mut seen = HashSet::new();
    let feed_addresses: Vec<Pubkey> = markets
        .values()
        .map(|m| m.price_feed)
        .filter(|feed| seen.insert(*feed))
        .collect();
    let price_feeds: HashMap<Pubkey, PriceFeed> = source
        .get_price_feeds(&feed_addresses)
        .await
        .context("failed to fetch price feeds")?
        .into_iter()
        .flatten()
        .map(|feed| (feed.address, feed))
        .collect();

    debug!(
        exchange = %exchange.address,
        listed = market_addresses.len(),
        markets = markets.len(),
        price_feeds = price_feeds.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Loaded market context"
    );

    Ok(MarketContext {
        exchange,
        markets,
        price_feeds,
    })
}
