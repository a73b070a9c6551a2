//! Runtime configuration: profiles, TOML files and environment overrides.

mod bot;

pub use bot::{
    BotConfig, RefreshConfig, RpcSettings, StoreConfig, SubmitterSettings, TierConfig,
    WorkerConfig,
};
