//! Account, market and margin records shared by the ranker, workers and executor.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use solana_sdk::pubkey::Pubkey;
use std::collections::HashMap;

use crate::fixed::Fixed;

/// Serialize a [`Pubkey`] as its base58 string.
pub mod pubkey_str {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use solana_sdk::pubkey::Pubkey;
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(key: &Pubkey, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(key)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Pubkey, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Pubkey::from_str(raw.trim()).map_err(D::Error::custom)
    }
}

/// A position held by a margin account in one market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub market_id: u32,
    pub size: Fixed,
}

/// Raw margin account as returned by the chain source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginAccount {
    #[serde(with = "pubkey_str")]
    pub address: Pubkey,
    #[serde(with = "pubkey_str")]
    pub owner: Pubkey,
    #[serde(with = "pubkey_str")]
    pub exchange: Pubkey,
    #[serde(default)]
    pub positions: SmallVec<[Position; 8]>,
    /// Protocol-specific fields, passed through to the risk engine untouched.
    #[serde(default)]
    pub extra: serde_json::Value,
}

/// Market id and address as listed by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketSlot {
    pub id: u32,
    #[serde(with = "pubkey_str")]
    pub address: Pubkey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    #[serde(with = "pubkey_str")]
    pub address: Pubkey,
    pub markets: Vec<MarketSlot>,
    #[serde(default)]
    pub extra: serde_json::Value,
}

impl Exchange {
    /// Addresses of listed markets. Id 0 marks an unused slot.
    pub fn active_market_addresses(&self) -> Vec<Pubkey> {
        self.markets
            .iter()
            .filter(|slot| slot.id != 0)
            .map(|slot| slot.address)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub id: u32,
    #[serde(with = "pubkey_str")]
    pub address: Pubkey,
    #[serde(with = "pubkey_str")]
    pub price_feed: Pubkey,
    #[serde(default)]
    pub extra: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceFeed {
    #[serde(with = "pubkey_str")]
    pub address: Pubkey,
    pub price: Fixed,
    pub publish_time: i64,
    #[serde(default)]
    pub extra: serde_json::Value,
}

/// Exchange, markets and price feeds evaluated together in one pass.
#[derive(Debug, Clone)]
pub struct MarketContext {
    pub exchange: Exchange,
    /// Markets keyed by market id
    pub markets: HashMap<u32, Market>,
    /// Price feeds keyed by feed address
    pub price_feeds: HashMap<Pubkey, PriceFeed>,
}

impl MarketContext {
    pub fn market(&self, market_id: u32) -> Option<&Market> {
        self.markets.get(&market_id)
    }

    pub fn price_feed(&self, address: &Pubkey) -> Option<&PriceFeed> {
        self.price_feeds.get(address)
    }
}

/// Risk engine output for one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginResult {
    pub available_margin: Fixed,
    pub required_margin: Fixed,
    /// Per-asset margin components
    pub components: SmallVec<[Fixed; 4]>,
    /// Liquidation verdict reported by the risk engine
    pub liquidatable: bool,
}

impl MarginResult {
    /// Build a result whose verdict follows the distance rule (`distance <= 0`).
    pub fn new(available_margin: Fixed, required_margin: Fixed, components: SmallVec<[Fixed; 4]>) -> Self {
        let liquidatable = !available_margin.saturating_sub(required_margin).is_positive();
        Self {
            available_margin,
            required_margin,
            components,
            liquidatable,
        }
    }

    /// Override the verdict with the one reported by the protocol.
    pub fn with_verdict(mut self, liquidatable: bool) -> Self {
        self.liquidatable = liquidatable;
        self
    }

    /// Signed headroom before liquidation.
    pub fn distance(&self) -> Fixed {
        self.available_margin.saturating_sub(self.required_margin)
    }

    /// An account is in use when no margin component is exactly zero.
    pub fn is_used(&self) -> bool {
        self.components.iter().all(|c| !c.is_zero())
    }

    pub fn can_liquidate(&self) -> bool {
        self.liquidatable
    }
}

/// Ranked entry: an account's margins frozen at evaluation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    #[serde(with = "pubkey_str")]
    pub address: Pubkey,
    pub distance: Fixed,
    pub margins: MarginResult,
    /// Unix seconds of the evaluation
    pub evaluated_at: i64,
}

impl AccountSnapshot {
    pub fn new(address: Pubkey, margins: MarginResult, evaluated_at: i64) -> Self {
        Self {
            address,
            distance: margins.distance(),
            margins,
            evaluated_at,
        }
    }

    pub fn is_used(&self) -> bool {
        self.margins.is_used()
    }

    /// Liquidation verdict of the margins this snapshot was built from.
    pub fn is_eligible(&self) -> bool {
        self.margins.can_liquidate()
    }
}
