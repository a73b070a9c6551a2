//! Redis-backed ranked store.
//!
//! The JSON-serialized list lives under one key and a sibling `<key>:version`
//! counter is bumped on every write. Conditional writes run as a Lua script so
//! the version check and the `SET` happen atomically on the server.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::sync::Arc;
use tracing::{debug, info};

use super::{RankedStore, StoreError, Versioned};
use crate::account::AccountSnapshot;
use crate::ranked_list::RankedList;

/// KEYS[1] list, KEYS[2] version. ARGV[1] expected version or empty for an
/// unconditional write, ARGV[2] payload. Returns `{applied, version}`.
const WRITE_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[2]) or '0')
if ARGV[1] ~= '' and tonumber(ARGV[1]) ~= current then
  return {0, current}
end
redis.call('SET', KEYS[1], ARGV[2])
return {1, redis.call('INCR', KEYS[2])}
"#;

/// Ranked list shared between processes through a Redis key.
pub struct RedisRankedStore {
    conn: ConnectionManager,
    key: String,
    version_key: String,
    script: Script,
}

impl RedisRankedStore {
    /// Connect to `url` and use `key` for the list.
    pub async fn connect(url: &str, key: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let conn = client.get_connection_manager().await.map_err(unavailable)?;
        let key = key.into();
        info!(key = %key, "Connected to redis ranked store");

        Ok(Self {
            conn,
            version_key: version_key(&key),
            key,
            script: Script::new(WRITE_SCRIPT),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    async fn write(&self, expected: Option<u64>, list: &RankedList) -> Result<u64, StoreError> {
        let payload = encode_list(list)?;
        let mut conn = self.conn.clone();
        let reply: (i64, u64) = self
            .script
            .key(&self.key)
            .key(&self.version_key)
            .arg(expected.map(|v| v.to_string()).unwrap_or_default())
            .arg(payload)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        let version = write_outcome(expected, reply)?;
        debug!(key = %self.key, version, len = list.len(), "Wrote ranked list");
        Ok(version)
    }
}

fn unavailable(e: redis::RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn version_key(key: &str) -> String {
    format!("{key}:version")
}

fn encode_list(list: &RankedList) -> Result<String, StoreError> {
    serde_json::to_string(list).map_err(|e| StoreError::Malformed(e.to_string()))
}

/// A missing key reads as an empty list.
fn decode_list(raw: Option<String>) -> Result<RankedList, StoreError> {
    let Some(raw) = raw else {
        return Ok(RankedList::new());
    };
    let list: RankedList = serde_json::from_str(&raw).map_err(|e| StoreError::Malformed(e.to_string()))?;
    if !list.is_sorted() {
        return Err(StoreError::Malformed("list is not sorted and unique".to_string()));
    }
    Ok(list)
}

fn write_outcome(expected: Option<u64>, (applied, version): (i64, u64)) -> Result<u64, StoreError> {
    if applied == 1 {
        return Ok(version);
    }
    Err(StoreError::Stale {
        expected: expected.unwrap_or_default(),
        actual: version,
    })
}

#[async_trait]
impl RankedStore for RedisRankedStore {
    async fn read(&self) -> Result<Versioned, StoreError> {
        let mut conn = self.conn.clone();
        let (raw, version): (Option<String>, Option<u64>) = redis::cmd("MGET")
            .arg(&self.key)
            .arg(&self.version_key)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(Versioned {
            version: version.unwrap_or(0),
            list: Arc::new(decode_list(raw)?),
        })
    }

    async fn replace_all(&self, list: RankedList) -> Result<u64, StoreError> {
        self.write(None, &list).await
    }

    async fn merge_range(
        &self,
        expected: Option<u64>,
        before: &[AccountSnapshot],
        after: &[AccountSnapshot],
        updated: Vec<AccountSnapshot>,
    ) -> Result<u64, StoreError> {
        let merged = RankedList::merge_range(before, after, updated);
        self.write(expected, &merged).await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .del(&self.key)
            .ignore()
            .incr(&self.version_key, 1)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        debug!(key = %self.key, "Deleted ranked list");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::MarginResult;
    use crate::fixed::Fixed;
    use smallvec::smallvec;
    use solana_sdk::pubkey::Pubkey;

    fn snapshot(distance: i64) -> AccountSnapshot {
        AccountSnapshot::new(
            Pubkey::new_unique(),
            MarginResult::new(Fixed::from_int(distance), Fixed::ZERO, smallvec![Fixed::ONE]),
            0,
        )
    }

    #[test]
    fn test_missing_key_is_empty_list() {
        assert!(decode_list(None).unwrap().is_empty());
    }

    #[test]
    fn test_stored_json_decodes() {
        let list = RankedList::from_unsorted(vec![snapshot(4), snapshot(-1), snapshot(2)]);
        let decoded = decode_list(Some(encode_list(&list).unwrap())).unwrap();
        assert_eq!(decoded, list);
    }

    #[test]
    fn test_unsorted_payload_is_malformed() {
        let entries = vec![snapshot(5), snapshot(1)];
        let raw = serde_json::to_string(&entries).unwrap();
        assert!(matches!(decode_list(Some(raw)), Err(StoreError::Malformed(_))));
        assert!(matches!(decode_list(Some("{".into())), Err(StoreError::Malformed(_))));
    }

    #[test]
    fn test_rejected_script_reply_is_stale() {
        assert_eq!(write_outcome(None, (1, 7)).unwrap(), 7);
        assert_eq!(write_outcome(Some(6), (1, 7)).unwrap(), 7);

        let err = write_outcome(Some(3), (0, 5)).unwrap_err();
        assert!(matches!(err, StoreError::Stale { expected: 3, actual: 5 }));
    }

    #[test]
    fn test_version_key_is_sibling() {
        assert_eq!(version_key("liquidator:ranked"), "liquidator:ranked:version");
    }

    #[tokio::test]
    #[ignore] // Requires a running redis
    async fn test_redis_round_trip() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        let key = format!("liquidator:test:{}", Pubkey::new_unique());
        let store = RedisRankedStore::connect(&url, key).await.unwrap();

        store.clear().await.unwrap();
        let v1 = store
            .replace_all(RankedList::from_unsorted(vec![snapshot(3), snapshot(1)]))
            .await
            .unwrap();
        let read = store.read().await.unwrap();
        assert_eq!(read.version, v1);
        assert_eq!(read.list.len(), 2);

        store.merge_range(None, read.list.as_slice(), &[], vec![snapshot(2)]).await.unwrap();
        let err = store
            .merge_range(Some(v1), &[], &[], vec![snapshot(0)])
            .await
            .unwrap_err();
        assert!(err.is_stale());
        assert_eq!(store.read().await.unwrap().list.len(), 3);

        store.clear().await.unwrap();
        assert!(store.read().await.unwrap().list.is_empty());
    }
}
