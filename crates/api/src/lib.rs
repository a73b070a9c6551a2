//! Liquidator API clients for external services.
//!
//! This crate provides the HTTP client for the protocol gateway, which
//! backs the chain data source, risk engine and transaction encoder.

mod gateway;

pub use gateway::GatewayClient;
