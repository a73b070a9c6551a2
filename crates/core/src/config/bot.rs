//! Configuration management with profile support.
//!
//! Provides centralized configuration for all scheduler parameters with
//! support for different profiles (testing, production, aggressive).

use anyhow::{bail, Context};
use liquidator_chain::{Commitment, SubmitterConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::store::{StoreBackend, StoreWriteMode};
use crate::tiers::{TierLayout, MAX_TIERS};

/// Main configuration structure containing all scheduler parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Profile name (for logging/identification)
    #[serde(default = "default_profile_name")]
    pub profile: String,

    /// Tier layout
    #[serde(default)]
    pub tiers: TierConfig,

    /// Full list rebuild
    #[serde(default)]
    pub refresh: RefreshConfig,

    /// Worker failure handling and fetch fan-out
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Ranked store write behaviour
    #[serde(default)]
    pub store: StoreConfig,

    /// Transaction submission timing and fees
    #[serde(default)]
    pub submitter: SubmitterSettings,

    /// RPC connection settings
    #[serde(default)]
    pub rpc: RpcSettings,
}

fn default_profile_name() -> String {
    "default".to_string()
}

/// Geometric tier layout parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Number of tier workers; the last one owns the unbounded tail
    #[serde(default = "default_tier_count")]
    pub count: usize,

    /// Poll interval of tier 0 (seconds); tier `i` polls every `base * 2^i`
    #[serde(default = "default_base_interval")]
    pub base_interval_secs: u64,
}

fn default_tier_count() -> usize {
    6
}
fn default_base_interval() -> u64 {
    10
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            count: default_tier_count(),
            base_interval_secs: default_base_interval(),
        }
    }
}

impl TierConfig {
    pub fn base_interval(&self) -> Duration {
        Duration::from_secs(self.base_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Full rebuild interval (seconds)
    #[serde(default = "default_refresh_interval")]
    pub interval_secs: u64,
}

fn default_refresh_interval() -> u64 {
    60
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_refresh_interval(),
        }
    }
}

impl RefreshConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Consecutive failed ticks before a worker stops (0 = never)
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,

    /// Concurrent margin evaluations per pass
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
}

fn default_max_failures() -> u32 {
    10
}
fn default_fetch_concurrency() -> usize {
    16
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: default_max_failures(),
            fetch_concurrency: default_fetch_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection URL of an external backend
    #[serde(default)]
    pub url: Option<String>,

    /// Key holding the serialized list
    #[serde(default = "default_store_key")]
    pub key: String,

    #[serde(default)]
    pub write_mode: StoreWriteMode,

    /// Merge retries after a rejected optimistic write
    #[serde(default = "default_merge_retries")]
    pub max_merge_retries: u32,
}

fn default_store_key() -> String {
    "liquidator:ranked".to_string()
}
fn default_merge_retries() -> u32 {
    3
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: None,
            key: default_store_key(),
            write_mode: StoreWriteMode::default(),
            max_merge_retries: default_merge_retries(),
        }
    }
}

/// Submitter settings as written in config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitterSettings {
    /// Priority fee (micro-lamports per compute unit)
    #[serde(default = "default_compute_unit_price")]
    pub compute_unit_price_micro_lamports: u64,

    /// Re-broadcast cadence (milliseconds)
    #[serde(default = "default_resend_interval")]
    pub resend_interval_ms: u64,

    /// Status poll cadence (milliseconds)
    #[serde(default = "default_status_poll_interval")]
    pub status_poll_interval_ms: u64,

    /// Blocks subtracted from the blockhash expiry height
    #[serde(default = "default_expiry_margin")]
    pub expiry_margin_blocks: u64,

    /// Record lookup attempts after confirmation
    #[serde(default = "default_lookup_attempts")]
    pub lookup_attempts: u32,

    /// First lookup retry delay (milliseconds)
    #[serde(default = "default_lookup_min_backoff")]
    pub lookup_min_backoff_ms: u64,

    #[serde(default = "default_lookup_backoff_factor")]
    pub lookup_backoff_factor: f64,
}

fn default_compute_unit_price() -> u64 {
    10_000
}
fn default_resend_interval() -> u64 {
    2_000
}
fn default_status_poll_interval() -> u64 {
    2_000
}
fn default_expiry_margin() -> u64 {
    150
}
fn default_lookup_attempts() -> u32 {
    5
}
fn default_lookup_min_backoff() -> u64 {
    1_000
}
fn default_lookup_backoff_factor() -> f64 {
    2.0
}

impl Default for SubmitterSettings {
    fn default() -> Self {
        Self {
            compute_unit_price_micro_lamports: default_compute_unit_price(),
            resend_interval_ms: default_resend_interval(),
            status_poll_interval_ms: default_status_poll_interval(),
            expiry_margin_blocks: default_expiry_margin(),
            lookup_attempts: default_lookup_attempts(),
            lookup_min_backoff_ms: default_lookup_min_backoff(),
            lookup_backoff_factor: default_lookup_backoff_factor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcSettings {
    #[serde(default)]
    pub commitment: Commitment,

    /// Per-request timeout (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            commitment: Commitment::default(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl RpcSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            profile: default_profile_name(),
            tiers: TierConfig::default(),
            refresh: RefreshConfig::default(),
            workers: WorkerConfig::default(),
            store: StoreConfig::default(),
            submitter: SubmitterSettings::default(),
            rpc: RpcSettings::default(),
        }
    }
}

impl BotConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path}"))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {path}"))?;
        Ok(config)
    }

    /// Short intervals and a single retry budget, for devnet runs.
    pub fn testing() -> Self {
        Self {
            profile: "testing".to_string(),
            tiers: TierConfig {
                count: 3,
                base_interval_secs: 2,
            },
            refresh: RefreshConfig { interval_secs: 15 },
            workers: WorkerConfig {
                max_consecutive_failures: 3,
                fetch_concurrency: 4,
            },
            store: StoreConfig::default(),
            submitter: SubmitterSettings {
                compute_unit_price_micro_lamports: 1_000,
                ..Default::default()
            },
            rpc: RpcSettings::default(),
        }
    }

    /// Conservative settings with optimistic store writes.
    pub fn production() -> Self {
        Self {
            profile: "production".to_string(),
            tiers: TierConfig::default(),
            refresh: RefreshConfig::default(),
            workers: WorkerConfig {
                max_consecutive_failures: 20,
                fetch_concurrency: 16,
            },
            store: StoreConfig {
                write_mode: StoreWriteMode::Optimistic,
                max_merge_retries: 3,
                ..Default::default()
            },
            submitter: SubmitterSettings::default(),
            rpc: RpcSettings::default(),
        }
    }

    /// Faster tiers and a higher priority fee.
    pub fn aggressive() -> Self {
        Self {
            profile: "aggressive".to_string(),
            tiers: TierConfig {
                count: 8,
                base_interval_secs: 2,
            },
            refresh: RefreshConfig { interval_secs: 30 },
            workers: WorkerConfig {
                max_consecutive_failures: 20,
                fetch_concurrency: 32,
            },
            store: StoreConfig {
                write_mode: StoreWriteMode::Optimistic,
                max_merge_retries: 5,
                ..Default::default()
            },
            submitter: SubmitterSettings {
                compute_unit_price_micro_lamports: 50_000,
                resend_interval_ms: 1_000,
                status_poll_interval_ms: 1_000,
                ..Default::default()
            },
            rpc: RpcSettings {
                commitment: Commitment::Processed,
                request_timeout_secs: 15,
            },
        }
    }

    /// Get profile from environment variable BOT_PROFILE, or default.
    /// Supported values: testing, production, aggressive
    pub fn from_env() -> Self {
        let profile = std::env::var("BOT_PROFILE").unwrap_or_else(|_| "default".to_string());
        match profile.to_lowercase().as_str() {
            "testing" | "test" => Self::testing(),
            "production" | "prod" => Self::production(),
            "aggressive" | "aggro" => Self::aggressive(),
            _ => Self::default(),
        }
    }

    /// `BOT_CONFIG` file if set, otherwise the `BOT_PROFILE` profile, then
    /// the `INTERVAL`, `TIER_COUNT`, `COMMITMENT` and `REDIS_URL` overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var("BOT_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::from_env(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply single-value overrides from the environment.
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(raw) = std::env::var("INTERVAL") {
            self.tiers.base_interval_secs = raw
                .trim()
                .parse()
                .with_context(|| format!("INTERVAL must be a number of seconds, got {raw:?}"))?;
        }
        if let Ok(raw) = std::env::var("TIER_COUNT") {
            self.tiers.count = raw
                .trim()
                .parse()
                .with_context(|| format!("TIER_COUNT must be a positive integer, got {raw:?}"))?;
        }
        if let Ok(raw) = std::env::var("COMMITMENT") {
            if !raw.trim().is_empty() {
                self.rpc.commitment = raw.parse()?;
            }
        }
        if let Ok(raw) = std::env::var("REDIS_URL") {
            if !raw.trim().is_empty() {
                self.store.backend = StoreBackend::Redis;
                self.store.url = Some(raw.trim().to_string());
            }
        }
        Ok(())
    }

    /// Reject values that would break the tier layout or stall a worker.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tiers.count == 0 || self.tiers.count > MAX_TIERS {
            bail!("tiers.count must be between 1 and {MAX_TIERS}, got {}", self.tiers.count);
        }
        if self.tiers.base_interval_secs == 0 {
            bail!("tiers.base_interval_secs must be positive");
        }
        if self.refresh.interval_secs == 0 {
            bail!("refresh.interval_secs must be positive");
        }
        if self.workers.fetch_concurrency == 0 {
            bail!("workers.fetch_concurrency must be positive");
        }
        if self.submitter.resend_interval_ms == 0 || self.submitter.status_poll_interval_ms == 0 {
            bail!("submitter poll intervals must be positive");
        }
        if self.store.backend == StoreBackend::Redis && self.store.url.is_none() {
            bail!("store.url is required for the redis backend");
        }
        if self.store.key.trim().is_empty() {
            bail!("store.key must not be empty");
        }
        if self.submitter.lookup_backoff_factor < 1.0 {
            bail!("submitter.lookup_backoff_factor must be at least 1.0");
        }
        Ok(())
    }

    pub fn tier_layout(&self) -> TierLayout {
        TierLayout::geometric(self.tiers.count, self.tiers.base_interval())
    }

    pub fn submitter_config(&self) -> SubmitterConfig {
        let s = &self.submitter;
        SubmitterConfig {
            compute_unit_price: s.compute_unit_price_micro_lamports,
            resend_interval: Duration::from_millis(s.resend_interval_ms),
            status_poll_interval: Duration::from_millis(s.status_poll_interval_ms),
            expiry_margin_blocks: s.expiry_margin_blocks,
            lookup_attempts: s.lookup_attempts,
            lookup_min_backoff: Duration::from_millis(s.lookup_min_backoff_ms),
            lookup_backoff_factor: s.lookup_backoff_factor,
            ..SubmitterConfig::default()
        }
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        tracing::info!(profile = %self.profile, "Bot configuration loaded");
        tracing::info!(
            tiers = self.tiers.count,
            base_interval_secs = self.tiers.base_interval_secs,
            refresh_interval_secs = self.refresh.interval_secs,
            "Scheduling"
        );
        for tier in self.tier_layout().tiers() {
            tracing::info!(
                tier = tier.index,
                range = %tier.range,
                interval_secs = tier.poll_interval.as_secs(),
                "Tier"
            );
        }
        tracing::info!(
            backend = ?self.store.backend,
            key = %self.store.key,
            write_mode = ?self.store.write_mode,
            max_merge_retries = self.store.max_merge_retries,
            max_consecutive_failures = self.workers.max_consecutive_failures,
            fetch_concurrency = self.workers.fetch_concurrency,
            "Store and workers"
        );
        tracing::info!(
            compute_unit_price = self.submitter.compute_unit_price_micro_lamports,
            resend_ms = self.submitter.resend_interval_ms,
            expiry_margin_blocks = self.submitter.expiry_margin_blocks,
            commitment = %self.rpc.commitment,
            "Submission parameters"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BotConfig::default();
        assert_eq!(config.tiers.count, 6);
        assert_eq!(config.tiers.base_interval_secs, 10);
        assert_eq!(config.refresh.interval_secs, 60);
        assert_eq!(config.store.write_mode, StoreWriteMode::LastWriteWins);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_profiles_validate() {
        for config in [BotConfig::testing(), BotConfig::production(), BotConfig::aggressive()] {
            assert!(config.validate().is_ok(), "profile {} invalid", config.profile);
        }
        assert_eq!(BotConfig::production().store.write_mode, StoreWriteMode::Optimistic);
    }

    #[test]
    fn test_submitter_config_matches_settings() {
        let config = BotConfig::default().submitter_config();
        assert_eq!(config.compute_unit_price, 10_000);
        assert_eq!(config.resend_interval, Duration::from_secs(2));
        assert_eq!(config.expiry_margin_blocks, 150);
        assert_eq!(config.lookup_attempts, 5);
    }

    #[test]
    fn test_layout_follows_tier_config() {
        let layout = BotConfig::testing().tier_layout();
        assert_eq!(layout.len(), 3);
        assert_eq!(layout.tiers()[1].poll_interval, Duration::from_secs(4));
    }

    #[test]
    fn test_validate_rejects_zero_tiers() {
        let mut config = BotConfig::default();
        config.tiers.count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: BotConfig = toml::from_str(
            r#"
            profile = "custom"

            [tiers]
            count = 4

            [store]
            write_mode = "optimistic"
            "#,
        )
        .unwrap();
        assert_eq!(config.tiers.count, 4);
        assert_eq!(config.tiers.base_interval_secs, 10);
        assert_eq!(config.store.write_mode, StoreWriteMode::Optimistic);
        assert_eq!(config.store.max_merge_retries, 3);
        assert_eq!(config.rpc.commitment, Commitment::Confirmed);
    }

    #[test]
    fn test_redis_backend_needs_url() {
        let mut config: BotConfig = toml::from_str(
            r#"
            [store]
            backend = "redis"
            key = "perp:ranked"
            "#,
        )
        .unwrap();
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.key, "perp:ranked");
        assert!(config.validate().is_err());

        config.store.url = Some("redis://127.0.0.1/".to_string());
        assert!(config.validate().is_ok());
        assert_eq!(BotConfig::default().store.backend, StoreBackend::Memory);
    }

    #[test]
    fn test_serialization() {
        let config = BotConfig::aggressive();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("profile = \"aggressive\""));

        let parsed: BotConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.profile, "aggressive");
        assert_eq!(parsed.rpc.commitment, Commitment::Processed);
    }
}
