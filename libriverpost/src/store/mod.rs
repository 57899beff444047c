//! Shared key-value store
//!
//! Every service process talks to the same store. The store offers the small
//! set of primitives the rest of the crate is built on: hashes, integer-scored
//! sorted sets, sets and lists with a blocking multi-key pop. Keys of
//! different kinds live in separate namespaces.
//!
//! Two implementations are provided:
//!
//! - [`MemoryStore`]: in-process, used by tests and single-process setups
//! - [`SqliteStore`]: file-backed and shared between processes

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::Result;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Interval between pops when a store has no push notification
pub const BLOCKING_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[async_trait]
pub trait Store: Send + Sync {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    /// Returns true if the field existed
    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;
    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>>;
    /// Adds `delta` to an integer field (missing counts as 0) and returns the new value
    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    /// Insert or move `member` to `score`
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;
    /// Members with score <= `max`, ascending by score, at most `limit` of them
    async fn zrange_by_score(
        &self,
        key: &str,
        max: i64,
        limit: Option<usize>,
    ) -> Result<Vec<(String, i64)>>;
    /// Lowest-scored member
    async fn zfirst(&self, key: &str) -> Result<Option<(String, i64)>>;
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>>;
    async fn zcard(&self, key: &str) -> Result<usize>;

    /// Returns true if the member was new
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;
    /// Removes and returns an arbitrary member
    async fn spop(&self, key: &str) -> Result<Option<String>>;
    /// All members, sorted
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;
    async fn scard(&self, key: &str) -> Result<usize>;

    /// Append at the tail, returns the new length
    async fn rpush(&self, key: &str, value: &str) -> Result<usize>;
    /// Insert at the head, returns the new length
    async fn lpush(&self, key: &str, value: &str) -> Result<usize>;
    async fn lpop(&self, key: &str) -> Result<Option<String>>;
    async fn llen(&self, key: &str) -> Result<usize>;
    /// The first `count` entries from the head
    async fn lrange(&self, key: &str, count: usize) -> Result<Vec<String>>;
    /// Keep only the first `keep` entries
    async fn ltrim(&self, key: &str, keep: usize) -> Result<()>;

    /// Remove a key of any kind
    async fn del(&self, key: &str) -> Result<()>;

    /// Pop the head of the first non-empty list among `keys`
    ///
    /// Waits up to `timeout` for a value and returns `(key, value)`, or
    /// `None` on timeout. The default implementation polls every
    /// [`BLOCKING_POLL_INTERVAL`].
    async fn blpop(&self, keys: &[String], timeout: Duration) -> Result<Option<(String, String)>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            for key in keys {
                if let Some(value) = self.lpop(key).await? {
                    return Ok(Some((key.clone(), value)));
                }
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(BLOCKING_POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}
