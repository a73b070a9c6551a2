//! Protocol gateway client.
//!
//! The gateway is a sidecar that owns the exchange's account layouts, margin
//! formulas and instruction builders. This client fetches typed accounts,
//! asks for margins and requests liquidation instructions over HTTP.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use liquidator_chain::{ChainError, UnsignedTransaction};
use liquidator_core::{
    pubkey_str, ChainSource, Exchange, Fixed, LiquidateAccounts, LiquidateParams, MarginAccount,
    MarginResult, Market, MarketContext, PriceFeed, RiskEngine, TransactionEncoder,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// Request body for batched account lookups.
#[derive(Debug, Serialize)]
struct AddressesRequest {
    addresses: Vec<String>,
}

impl AddressesRequest {
    fn new(addresses: &[Pubkey]) -> Self {
        Self {
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// One slot per requested address, `null` where the account does not exist.
#[derive(Debug, Deserialize)]
struct BatchResponse<T> {
    accounts: Vec<Option<T>>,
}

#[derive(Debug, Deserialize)]
struct AccountsResponse {
    accounts: Vec<MarginAccount>,
}

#[derive(Debug, Serialize)]
struct MarginsRequest<'a> {
    account: &'a MarginAccount,
    exchange: &'a Exchange,
    markets: Vec<&'a Market>,
    price_feeds: Vec<&'a PriceFeed>,
    now: i64,
}

#[derive(Debug, Deserialize)]
struct MarginsResponse {
    available_margin: Fixed,
    required_margin: Fixed,
    #[serde(default)]
    components: Vec<Fixed>,
    can_liquidate: bool,
}

impl From<MarginsResponse> for MarginResult {
    fn from(r: MarginsResponse) -> Self {
        MarginResult::new(r.available_margin, r.required_margin, r.components.into_iter().collect())
            .with_verdict(r.can_liquidate)
    }
}

#[derive(Debug, Serialize)]
struct LiquidateRequest<'a> {
    accounts: &'a LiquidateAccounts,
    markets: Vec<String>,
    price_feeds: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a LiquidateParams>,
}

#[derive(Debug, Deserialize)]
struct LiquidateResponse {
    instructions: Vec<InstructionDto>,
}

#[derive(Debug, Clone, Deserialize)]
struct AccountMetaDto {
    #[serde(with = "pubkey_str")]
    pubkey: Pubkey,
    is_signer: bool,
    is_writable: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct InstructionDto {
    #[serde(with = "pubkey_str")]
    program_id: Pubkey,
    accounts: Vec<AccountMetaDto>,
    /// Base64 instruction data
    data: String,
}

impl InstructionDto {
    fn into_instruction(self) -> Result<Instruction> {
        let data = BASE64
            .decode(self.data.as_bytes())
            .with_context(|| format!("invalid instruction data for program {}", self.program_id))?;
        let accounts = self
            .accounts
            .into_iter()
            .map(|meta| AccountMeta {
                pubkey: meta.pubkey,
                is_signer: meta.is_signer,
                is_writable: meta.is_writable,
            })
            .collect();
        Ok(Instruction {
            program_id: self.program_id,
            accounts,
            data,
        })
    }
}

/// HTTP client for the protocol gateway.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    client: reqwest::Client,
    base_url: String,
}

impl GatewayClient {
    /// Create a client with a 30 s request timeout.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ChainError> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    /// Batched lookup that must return exactly one slot per address.
    async fn fetch_batch<T: DeserializeOwned>(&self, path: &str, addresses: &[Pubkey]) -> Result<Vec<Option<T>>, ChainError> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let response: BatchResponse<T> = self.post(path, &AddressesRequest::new(addresses)).await?;
        check_batch_len(addresses.len(), response.accounts.len())?;

        debug!(
            path,
            requested = addresses.len(),
            found = response.accounts.iter().filter(|a| a.is_some()).count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Fetched accounts from gateway"
        );
        Ok(response.accounts)
    }
}

fn check_batch_len(requested: usize, returned: usize) -> Result<(), ChainError> {
    if requested != returned {
        return Err(ChainError::Decode(format!(
            "gateway returned {returned} slots for {requested} addresses"
        )));
    }
    Ok(())
}

/// Markets and feeds referenced by the account, in position order.
fn referenced_accounts<'a>(
    account: &MarginAccount,
    context: &'a MarketContext,
) -> Result<(Vec<&'a Market>, Vec<&'a PriceFeed>)> {
    let mut markets = Vec::with_capacity(account.positions.len());
    let mut feeds = Vec::with_capacity(account.positions.len());
    for position in &account.positions {
        let market = context
            .market(position.market_id)
            .with_context(|| format!("market {} is missing from the market map", position.market_id))?;
        let feed = context
            .price_feed(&market.price_feed)
            .with_context(|| format!("price feed {} for market {} is missing", market.price_feed, market.id))?;
        markets.push(market);
        feeds.push(feed);
    }
    Ok((markets, feeds))
}

#[async_trait]
impl ChainSource for GatewayClient {
    #[instrument(skip(self))]
    async fn get_exchange(&self, address: &Pubkey) -> Result<Option<Exchange>, ChainError> {
        let response = self
            .client
            .get(self.url(&format!("exchanges/{address}")))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json().await?))
    }

    async fn get_markets(&self, addresses: &[Pubkey]) -> Result<Vec<Option<Market>>, ChainError> {
        self.fetch_batch("markets", addresses).await
    }

    async fn get_price_feeds(&self, addresses: &[Pubkey]) -> Result<Vec<Option<PriceFeed>>, ChainError> {
        self.fetch_batch("price-feeds", addresses).await
    }

    #[instrument(skip(self))]
    async fn get_all_accounts(&self, exchange: &Pubkey) -> Result<Vec<MarginAccount>, ChainError> {
        let response: AccountsResponse = self
            .client
            .get(self.url("margin-accounts"))
            .query(&[("exchange", exchange.to_string())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.accounts)
    }

    async fn get_accounts(&self, addresses: &[Pubkey]) -> Result<Vec<Option<MarginAccount>>, ChainError> {
        self.fetch_batch("margin-accounts/batch", addresses).await
    }
}

#[async_trait]
impl RiskEngine for GatewayClient {
    async fn compute_margins(&self, account: &MarginAccount, context: &MarketContext, now: i64) -> Result<MarginResult> {
        let (markets, price_feeds) = referenced_accounts(account, context)?;
        let request = MarginsRequest {
            account,
            exchange: &context.exchange,
            markets,
            price_feeds,
            now,
        };

        let response: MarginsResponse = self
            .post("margins", &request)
            .await
            .with_context(|| format!("failed to compute margins for {}", account.address))?;
        Ok(response.into())
    }
}

#[async_trait]
impl TransactionEncoder for GatewayClient {
    #[instrument(skip_all, fields(account = %accounts.margin_account))]
    async fn build_liquidation(
        &self,
        accounts: &LiquidateAccounts,
        markets: &[Market],
        price_feeds: &[PriceFeed],
        params: Option<&LiquidateParams>,
        fee_payer: Pubkey,
    ) -> Result<UnsignedTransaction> {
        let request = LiquidateRequest {
            accounts,
            markets: markets.iter().map(|m| m.address.to_string()).collect(),
            price_feeds: price_feeds.iter().map(|f| f.address.to_string()).collect(),
            params,
        };

        let response: LiquidateResponse = self
            .post("instructions/liquidate", &request)
            .await
            .context("failed to fetch liquidation instructions")?;
        if response.instructions.is_empty() {
            bail!("gateway returned no liquidation instructions");
        }

        let instructions = response
            .instructions
            .into_iter()
            .map(InstructionDto::into_instruction)
            .collect::<Result<Vec<_>>>()?;
        Ok(UnsignedTransaction::new(instructions, fee_payer))
    }
}
