//! In-memory doubles for the chain, risk engine and encoder.

use anyhow::{bail, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use liquidator_chain::{
    BlockhashInfo, ChainError, Commitment, RpcTransport, SignatureStatus, SubmitterConfig,
    TransactionRecord, UnsignedTransaction,
};
use parking_lot::Mutex;
use smallvec::smallvec;
use solana_sdk::hash::Hash;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::Transaction;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::account::{
    Exchange, MarginAccount, MarginResult, Market, MarketContext, MarketSlot, Position, PriceFeed,
};
use crate::fixed::Fixed;
use crate::source::{ChainSource, LiquidateAccounts, LiquidateParams, RiskEngine, TransactionEncoder};

/// Submitter timings scaled down to milliseconds.
pub fn fast_submitter_config() -> SubmitterConfig {
    SubmitterConfig {
        compute_unit_price: 1,
        resend_interval: Duration::from_millis(5),
        status_poll_interval: Duration::from_millis(5),
        confirm_poll_interval: Duration::from_millis(5),
        expiry_margin_blocks: EXPIRY_MARGIN,
        lookup_attempts: 3,
        lookup_min_backoff: Duration::from_millis(1),
        lookup_backoff_factor: 2.0,
    }
}

const EXPIRY_MARGIN: u64 = 150;

struct ChainState {
    exchange: Exchange,
    markets: HashMap<Pubkey, Market>,
    price_feeds: HashMap<Pubkey, PriceFeed>,
    accounts: Vec<MarginAccount>,
    fail_fetches: bool,
    confirm: bool,
    confirm_after_polls: u32,
    expiry_blocks: u64,
    polls: HashMap<Signature, u32>,
    sent: Vec<Signature>,
}

/// Chain data source and RPC transport backed by in-memory maps.
///
/// Block height advances by one on every `get_block_height` call.
/// Signatures confirm on the first status poll unless configured otherwise.
pub struct MockChain {
    state: Mutex<ChainState>,
    block_height: AtomicU64,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChain {
    pub fn new() -> Self {
        let exchange = Exchange {
            address: Pubkey::new_unique(),
            markets: vec![MarketSlot {
                id: 0,
                address: Pubkey::default(),
            }],
            extra: serde_json::Value::Null,
        };

        Self {
            state: Mutex::new(ChainState {
                exchange,
                markets: HashMap::new(),
                price_feeds: HashMap::new(),
                accounts: Vec::new(),
                fail_fetches: false,
                confirm: true,
                confirm_after_polls: 0,
                expiry_blocks: 1_000,
                polls: HashMap::new(),
                sent: Vec::new(),
            }),
            block_height: AtomicU64::new(100),
        }
    }

    pub fn exchange_address(&self) -> Pubkey {
        self.state.lock().exchange.address
    }

    /// List a market with a live price feed.
    pub fn add_market(&self, id: u32) -> Market {
        let market = Market {
            id,
            address: Pubkey::new_unique(),
            price_feed: Pubkey::new_unique(),
            extra: serde_json::Value::Null,
        };
        let feed = PriceFeed {
            address: market.price_feed,
            price: Fixed::ONE,
            publish_time: 0,
            extra: serde_json::Value::Null,
        };

        let mut state = self.state.lock();
        state.exchange.markets.push(MarketSlot {
            id,
            address: market.address,
        });
        state.markets.insert(market.address, market.clone());
        state.price_feeds.insert(feed.address, feed);
        market
    }

    /// List a market id whose account does not exist.
    pub fn list_missing_market(&self, id: u32) {
        self.state.lock().exchange.markets.push(MarketSlot {
            id,
            address: Pubkey::new_unique(),
        });
    }

    pub fn remove_price_feed(&self, address: &Pubkey) {
        self.state.lock().price_feeds.remove(address);
    }

    pub fn add_account(&self) -> MarginAccount {
        self.add_account_with_positions(&[])
    }

    pub fn add_account_with_positions(&self, market_ids: &[u32]) -> MarginAccount {
        let mut state = self.state.lock();
        let account = MarginAccount {
            address: Pubkey::new_unique(),
            owner: Pubkey::new_unique(),
            exchange: state.exchange.address,
            positions: market_ids
                .iter()
                .map(|id| Position {
                    market_id: *id,
                    size: Fixed::ONE,
                })
                .collect(),
            extra: serde_json::Value::Null,
        };
        state.accounts.push(account.clone());
        account
    }

    pub fn remove_account(&self, address: &Pubkey) {
        self.state.lock().accounts.retain(|a| a.address != *address);
    }

    /// Context as `load_market_context` would build it.
    pub fn context(&self) -> MarketContext {
        let state = self.state.lock();
        let markets: HashMap<u32, Market> = state
            .exchange
            .active_market_addresses()
            .iter()
            .filter_map(|address| state.markets.get(address))
            .map(|market| (market.id, market.clone()))
            .collect();
        let price_feeds = markets
            .values()
            .filter_map(|market| state.price_feeds.get(&market.price_feed))
            .map(|feed| (feed.address, feed.clone()))
            .collect();

        MarketContext {
            exchange: state.exchange.clone(),
            markets,
            price_feeds,
        }
    }

    /// Make every data-source call fail with a transient RPC error.
    pub fn fail_fetches(&self, fail: bool) {
        self.state.lock().fail_fetches = fail;
    }

    pub fn never_confirm(&self) {
        self.state.lock().confirm = false;
    }

    pub fn confirm_after_polls(&self, polls: u32) {
        self.state.lock().confirm_after_polls = polls;
    }

    /// Blockhashes expire `blocks` heights after the submitter's margin.
    pub fn expire_after_blocks(&self, blocks: u64) {
        self.state.lock().expiry_blocks = blocks;
    }

    pub fn sent_count(&self) -> usize {
        self.state.lock().sent.len()
    }

    fn check_fetch(&self) -> Result<(), ChainError> {
        if self.state.lock().fail_fetches {
            return Err(ChainError::Rpc {
                code: -32005,
                message: "node is behind".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChainSource for MockChain {
    async fn get_exchange(&self, address: &Pubkey) -> Result<Option<Exchange>, ChainError> {
        self.check_fetch()?;
        let state = self.state.lock();
        Ok((state.exchange.address == *address).then(|| state.exchange.clone()))
    }

    async fn get_markets(&self, addresses: &[Pubkey]) -> Result<Vec<Option<Market>>, ChainError> {
        self.check_fetch()?;
        let state = self.state.lock();
        Ok(addresses.iter().map(|a| state.markets.get(a).cloned()).collect())
    }

    async fn get_price_feeds(&self, addresses: &[Pubkey]) -> Result<Vec<Option<PriceFeed>>, ChainError> {
        self.check_fetch()?;
        let state = self.state.lock();
        Ok(addresses.iter().map(|a| state.price_feeds.get(a).cloned()).collect())
    }

    async fn get_all_accounts(&self, exchange: &Pubkey) -> Result<Vec<MarginAccount>, ChainError> {
        self.check_fetch()?;
        let state = self.state.lock();
        Ok(state
            .accounts
            .iter()
            .filter(|a| a.exchange == *exchange)
            .cloned()
            .collect())
    }

    async fn get_accounts(&self, addresses: &[Pubkey]) -> Result<Vec<Option<MarginAccount>>, ChainError> {
        self.check_fetch()?;
        let state = self.state.lock();
        Ok(addresses
            .iter()
            .map(|address| state.accounts.iter().find(|a| a.address == *address).cloned())
            .collect())
    }
}

#[async_trait]
impl RpcTransport for MockChain {
    async fn get_latest_blockhash(&self) -> Result<BlockhashInfo, ChainError> {
        let expiry_blocks = self.state.lock().expiry_blocks;
        let height = self.block_height.load(Ordering::SeqCst);
        Ok(BlockhashInfo {
            blockhash: Hash::new_unique(),
            last_valid_block_height: height + EXPIRY_MARGIN + expiry_blocks,
        })
    }

    async fn get_block_height(&self) -> Result<u64, ChainError> {
        Ok(self.block_height.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn send_raw_transaction(&self, wire: &[u8], _skip_preflight: bool) -> Result<Signature, ChainError> {
        let tx: Transaction =
            bincode::deserialize(wire).map_err(|e| ChainError::Decode(e.to_string()))?;
        let signature = tx
            .signatures
            .first()
            .copied()
            .ok_or_else(|| ChainError::Decode("unsigned transaction".to_string()))?;
        self.state.lock().sent.push(signature);
        Ok(signature)
    }

    async fn get_signature_status(&self, signature: &Signature) -> Result<Option<SignatureStatus>, ChainError> {
        let mut state = self.state.lock();
        if !state.confirm {
            return Ok(None);
        }
        let after = state.confirm_after_polls;
        let polls = state.polls.entry(*signature).or_insert(0);
        *polls += 1;
        if *polls <= after {
            return Ok(None);
        }
        Ok(Some(SignatureStatus {
            slot: 1,
            confirmation_status: Some(Commitment::Confirmed),
            err: None,
        }))
    }

    async fn get_transaction(&self, _signature: &Signature) -> Result<Option<TransactionRecord>, ChainError> {
        Ok(Some(TransactionRecord {
            slot: 1,
            block_time: Some(0),
            meta: serde_json::Value::Null,
        }))
    }
}

#[derive(Debug, Clone, Copy)]
enum RiskEntry {
    Distance(i64),
    Unused,
    Failing,
}

/// Risk engine returning scripted distances per account.
///
/// The default verdict is `distance <= 0`; [`TableRiskEngine::strict`]
/// reports only negative distances as liquidatable.
#[derive(Default)]
pub struct TableRiskEngine {
    entries: DashMap<Pubkey, RiskEntry>,
    strict: bool,
}

impl TableRiskEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::default()
        }
    }

    pub fn set_distance(&self, account: Pubkey, distance: i64) {
        self.entries.insert(account, RiskEntry::Distance(distance));
    }

    /// Report a zero margin component for `account`.
    pub fn set_unused(&self, account: Pubkey) {
        self.entries.insert(account, RiskEntry::Unused);
    }

    pub fn set_failing(&self, account: Pubkey) {
        self.entries.insert(account, RiskEntry::Failing);
    }
}

#[async_trait]
impl RiskEngine for TableRiskEngine {
    async fn compute_margins(&self, account: &MarginAccount, context: &MarketContext, _now: i64) -> Result<MarginResult> {
        for position in &account.positions {
            if context.market(position.market_id).is_none() {
                bail!("market {} is missing", position.market_id);
            }
        }

        let entry = self.entries.get(&account.address).map(|e| *e.value());
        match entry {
            Some(RiskEntry::Distance(distance)) => {
                let result = MarginResult::new(Fixed::from_int(distance), Fixed::ZERO, smallvec![Fixed::ONE]);
                Ok(if self.strict {
                    result.with_verdict(distance < 0)
                } else {
                    result
                })
            }
            Some(RiskEntry::Unused) => Ok(MarginResult::new(Fixed::ONE, Fixed::ZERO, smallvec![Fixed::ONE, Fixed::ZERO])),
            Some(RiskEntry::Failing) => bail!("price feed unavailable for {}", account.address),
            None => bail!("no margins scripted for {}", account.address),
        }
    }
}

/// Encoder emitting a single placeholder instruction per liquidation.
#[derive(Default)]
pub struct MockEncoder {
    built: Mutex<Vec<Pubkey>>,
    failing: Mutex<HashSet<Pubkey>>,
}

impl MockEncoder {
    pub const PROGRAM_ID: Pubkey = Pubkey::new_from_array([7; 32]);

    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, account: Pubkey) {
        self.failing.lock().insert(account);
    }

    /// Margin accounts a transaction was built for, in call order.
    pub fn built_for(&self) -> Vec<Pubkey> {
        self.built.lock().clone()
    }
}

#[async_trait]
impl TransactionEncoder for MockEncoder {
    async fn build_liquidation(
        &self,
        accounts: &LiquidateAccounts,
        markets: &[Market],
        price_feeds: &[PriceFeed],
        _params: Option<&LiquidateParams>,
        fee_payer: Pubkey,
    ) -> Result<UnsignedTransaction> {
        if self.failing.lock().contains(&accounts.margin_account) {
            bail!("encoder rejected {}", accounts.margin_account);
        }

        let mut metas = vec![
            AccountMeta::new(accounts.liquidator, true),
            AccountMeta::new(accounts.liquidator_margin_account, false),
            AccountMeta::new(accounts.margin_account, false),
            AccountMeta::new_readonly(accounts.exchange, false),
            AccountMeta::new_readonly(accounts.owner, false),
        ];
        metas.extend(markets.iter().map(|m| AccountMeta::new(m.address, false)));
        metas.extend(price_feeds.iter().map(|f| AccountMeta::new_readonly(f.address, false)));

        self.built.lock().push(accounts.margin_account);
        Ok(UnsignedTransaction::new(
            vec![Instruction::new_with_bytes(Self::PROGRAM_ID, &[0], metas)],
            fee_payer,
        ))
    }
}
