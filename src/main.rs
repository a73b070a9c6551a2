//! Tiered liquidation scheduler
//!
//! Keeps every margin account of one exchange ranked by distance to
//! liquidation and polls the riskiest slice of that list most often.
//! - Refresh worker rebuilds the full ranked list on a slow cadence
//! - Tier workers re-evaluate geometric windows of the list
//! - Eligible accounts are liquidated through the transaction submitter

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use liquidator_api::GatewayClient;
use liquidator_chain::{RpcClient, TransactionSubmitter};
use liquidator_core::config::StoreConfig;
use liquidator_core::{
    BotConfig, LiquidateParams, Liquidator, MemoryRankedStore, RankedStore, RedisRankedStore,
    Scheduler, StoreBackend,
};

/// Environment variable names.
mod env {
    pub const RPC_URL: &str = "RPC_URL";
    pub const PRIVATE_KEY: &str = "PRIVATE_KEY";
    pub const LIQUIDATOR_MARGIN_ACCOUNT: &str = "LIQUIDATOR_MARGIN_ACCOUNT";
    pub const EXCHANGE_ADDRESS: &str = "EXCHANGE_ADDRESS";
    pub const GATEWAY_URL: &str = "GATEWAY_URL";
    pub const LIQUIDATE_PARAMS: &str = "LIQUIDATE_PARAMS";
    pub const LOG_FORMAT: &str = "LOG_FORMAT";
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    // BOT_CONFIG selects a TOML file, otherwise BOT_PROFILE picks a preset
    let bot_config = BotConfig::load()?;
    bot_config.log_config();

    let config = load_config()?;
    info!(
        exchange = %config.exchange,
        liquidator = %config.signer.pubkey(),
        liquidator_margin_account = %config.liquidator_margin_account,
        "Starting tiered liquidator"
    );

    let scheduler = initialize_components(&bot_config, config).await?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
            }
            cancel.cancel();
        });
    }

    if let Err(e) = scheduler.run(cancel).await {
        error!(error = %format!("{e:#}"), "Scheduler stopped");
        return Err(e);
    }

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,liquidator_core=debug,liquidator_chain=debug"));

    let json = std::env::var(env::LOG_FORMAT).is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Configuration loaded from environment.
struct Config {
    rpc_url: String,
    gateway_url: String,
    signer: Keypair,
    liquidator_margin_account: Pubkey,
    exchange: Pubkey,
    params: Option<LiquidateParams>,
}

fn load_config() -> Result<Config> {
    let get_env = |name: &str| -> Result<String> {
        std::env::var(name).map_err(|_| anyhow!("Missing env var: {}", name))
    };

    let get_pubkey = |name: &str| -> Result<Pubkey> {
        get_env(name)?
            .parse()
            .map_err(|e| anyhow!("Invalid address for {}: {}", name, e))
    };

    let params = match std::env::var(env::LIQUIDATE_PARAMS) {
        Ok(raw) => Some(
            serde_json::from_str(&raw)
                .with_context(|| format!("Invalid JSON in {}", env::LIQUIDATE_PARAMS))?,
        ),
        Err(_) => None,
    };

    Ok(Config {
        rpc_url: get_env(env::RPC_URL)?,
        gateway_url: get_env(env::GATEWAY_URL)?,
        signer: parse_keypair(&get_env(env::PRIVATE_KEY)?)?,
        liquidator_margin_account: get_pubkey(env::LIQUIDATOR_MARGIN_ACCOUNT)?,
        exchange: get_pubkey(env::EXCHANGE_ADDRESS)?,
        params,
    })
}

/// Decode a base58 secret key.
fn parse_keypair(encoded: &str) -> Result<Keypair> {
    let bytes = bs58::decode(encoded.trim())
        .into_vec()
        .map_err(|e| anyhow!("Invalid base58 in {}: {}", env::PRIVATE_KEY, e))?;
    Keypair::from_bytes(&bytes).map_err(|e| anyhow!("Invalid keypair in {}: {}", env::PRIVATE_KEY, e))
}

async fn open_store(config: &StoreConfig) -> Result<Arc<dyn RankedStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryRankedStore::new())),
        StoreBackend::Redis => {
            let url = config
                .url
                .as_deref()
                .context("store.url is required for the redis backend")?;
            let store = RedisRankedStore::connect(url, config.key.clone())
                .await
                .context("Failed to connect to redis ranked store")?;
            Ok(Arc::new(store))
        }
    }
}

async fn initialize_components(bot_config: &BotConfig, config: Config) -> Result<Scheduler> {
    info!("Initializing components...");

    let rpc = Arc::new(RpcClient::with_timeout(
        &config.rpc_url,
        bot_config.rpc.commitment,
        bot_config.rpc.request_timeout(),
    )?);
    let block_height = rpc
        .health_check()
        .await
        .with_context(|| format!("RPC endpoint {} is unreachable", config.rpc_url))?;
    info!(block_height, "RPC health check passed");

    let gateway = Arc::new(GatewayClient::with_timeout(
        &config.gateway_url,
        bot_config.rpc.request_timeout(),
    )?);
    info!(rpc = %config.rpc_url, gateway = %gateway.base_url(), "Clients initialized");

    let submitter = Arc::new(TransactionSubmitter::new(rpc, bot_config.submitter_config()));

    let mut liquidator = Liquidator::new(
        gateway.clone(),
        submitter,
        Arc::new(config.signer),
        config.liquidator_margin_account,
    );
    if let Some(params) = config.params {
        liquidator = liquidator.with_params(params);
    }

    let scheduler = Scheduler::from_config(
        bot_config,
        gateway.clone(),
        gateway,
        open_store(&bot_config.store).await?,
        Arc::new(liquidator),
        config.exchange,
    );

    info!(tiers = scheduler.tier_count(), "All components initialized");
    Ok(scheduler)
}
