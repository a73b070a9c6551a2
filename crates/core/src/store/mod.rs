//! Shared ranked-candidate store.
//!
//! Every write replaces the whole list. In last-write-wins mode concurrent
//! writers may overwrite each other; in optimistic mode each write carries the
//! version it was computed from and is rejected if another write landed first.
//!
//! [`MemoryRankedStore`] serves a single process. [`RedisRankedStore`] keeps
//! the serialized list under one external key so several processes can share
//! it.

mod redis_store;

pub use redis_store::RedisRankedStore;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::account::AccountSnapshot;
use crate::ranked_list::RankedList;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("stale write: expected version {expected}, store is at {actual}")]
    Stale { expected: u64, actual: u64 },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("stored list is malformed: {0}")]
    Malformed(String),
}

impl StoreError {
    pub fn is_stale(&self) -> bool {
        matches!(self, StoreError::Stale { .. })
    }
}

/// How tier workers write back their window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreWriteMode {
    #[default]
    LastWriteWins,
    Optimistic,
}

/// Where the ranked list lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

/// List contents together with the version that produced them.
#[derive(Debug, Clone, Default)]
pub struct Versioned {
    pub version: u64,
    pub list: Arc<RankedList>,
}

#[async_trait]
pub trait RankedStore: Send + Sync {
    async fn read(&self) -> Result<Versioned, StoreError>;

    /// Unconditional overwrite. Returns the new version.
    async fn replace_all(&self, list: RankedList) -> Result<u64, StoreError>;

    /// Write `before ++ after` with `updated` merged in ascending position.
    /// With `expected` set, the write fails with [`StoreError::Stale`] unless
    /// the store is still at that version.
    async fn merge_range(
        &self,
        expected: Option<u64>,
        before: &[AccountSnapshot],
        after: &[AccountSnapshot],
        updated: Vec<AccountSnapshot>,
    ) -> Result<u64, StoreError>;

    /// Drop all content.
    async fn clear(&self) -> Result<(), StoreError>;
}

/// In-process store shared by all workers of one liquidator.
///
/// The lock is held only for the swap itself, never across a worker's
/// read-evaluate-write cycle.
#[derive(Debug, Default)]
pub struct MemoryRankedStore {
    inner: RwLock<Versioned>,
}

impl MemoryRankedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current contents without going through the async trait.
    pub fn snapshot(&self) -> Arc<RankedList> {
        self.inner.read().list.clone()
    }

    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    fn swap(&self, expected: Option<u64>, list: RankedList) -> Result<u64, StoreError> {
        let mut guard = self.inner.write();
        if let Some(expected) = expected {
            if guard.version != expected {
                return Err(StoreError::Stale {
                    expected,
                    actual: guard.version,
                });
            }
        }
        guard.version += 1;
        guard.list = Arc::new(list);
        Ok(guard.version)
    }
}

#[async_trait]
impl RankedStore for MemoryRankedStore {
    async fn read(&self) -> Result<Versioned, StoreError> {
        Ok(self.inner.read().clone())
    }

    async fn replace_all(&self, list: RankedList) -> Result<u64, StoreError> {
        let len = list.len();
        let version = self.swap(None, list)?;
        debug!(version, len, "Replaced ranked list");
        Ok(version)
    }

    async fn merge_range(
        &self,
        expected: Option<u64>,
        before: &[AccountSnapshot],
        after: &[AccountSnapshot],
        updated: Vec<AccountSnapshot>,
    ) -> Result<u64, StoreError> {
        let merged = RankedList::merge_range(before, after, updated);
        self.swap(expected, merged)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.swap(None, RankedList::new()).map(|_| ())
    }
}
