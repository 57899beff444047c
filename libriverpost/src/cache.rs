//! Per-account cache: poll bookkeeping, last document and activity histogram

use std::sync::Arc;

use crate::error::{Result, StoreError};
use crate::keys;
use crate::store::Store;
use crate::types::ActivityDocument;

pub const MINUTES_PER_DAY: u32 = 1440;

const POLL_STAMP: &str = "poll_stamp";
const REQUESTED: &str = "requested";
const ETAG: &str = "etag";
const UPDATED: &str = "updated";
const MAX_RESULTS: &str = "max_results";
const DOCUMENT: &str = "document";

/// Minute of the UTC day for an epoch
pub fn minute_of_day(epoch: i64) -> u32 {
    // rem_euclid keeps it in 0..1440
    epoch.div_euclid(60).rem_euclid(i64::from(MINUTES_PER_DAY)) as u32
}

/// Distance between two minutes of the day, going around midnight if shorter
pub fn circular_distance(a: u32, b: u32) -> u32 {
    let d = a.abs_diff(b) % MINUTES_PER_DAY;
    d.min(MINUTES_PER_DAY - d)
}

#[derive(Clone)]
pub struct AccountCache {
    store: Arc<dyn Store>,
}

impl AccountCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    async fn stamp(&self, gid: &str, field: &str) -> Result<Option<i64>> {
        let key = keys::cache(gid);
        match self.store.hget(&key, field).await? {
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                StoreError::Corrupt {
                    key: format!("{}/{}", key, field),
                    reason: format!("not an epoch: {}", raw),
                }
                .into()
            }),
            None => Ok(None),
        }
    }

    async fn set_stamp(&self, gid: &str, field: &str, value: i64) -> Result<()> {
        self.store
            .hset(&keys::cache(gid), field, &value.to_string())
            .await
    }

    pub async fn poll_stamp(&self, gid: &str) -> Result<Option<i64>> {
        self.stamp(gid, POLL_STAMP).await
    }

    pub async fn set_poll_stamp(&self, gid: &str, now: i64) -> Result<()> {
        self.set_stamp(gid, POLL_STAMP, now).await
    }

    /// When a front end last asked for this account
    pub async fn requested(&self, gid: &str) -> Result<Option<i64>> {
        self.stamp(gid, REQUESTED).await
    }

    pub async fn set_requested(&self, gid: &str, now: i64) -> Result<()> {
        self.set_stamp(gid, REQUESTED, now).await
    }

    pub async fn etag(&self, gid: &str) -> Result<Option<String>> {
        self.store.hget(&keys::cache(gid), ETAG).await
    }

    pub async fn set_etag(&self, gid: &str, etag: &str) -> Result<()> {
        self.store.hset(&keys::cache(gid), ETAG, etag).await
    }

    /// Update stamp of the cached document
    pub async fn updated(&self, gid: &str) -> Result<Option<i64>> {
        self.stamp(gid, UPDATED).await
    }

    pub async fn max_results(&self, gid: &str, default: u32) -> Result<u32> {
        Ok(self
            .store
            .hget(&keys::cache(gid), MAX_RESULTS)
            .await?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(default))
    }

    pub async fn set_max_results(&self, gid: &str, max_results: u32) -> Result<()> {
        self.store
            .hset(&keys::cache(gid), MAX_RESULTS, &max_results.to_string())
            .await
    }

    pub async fn document(&self, gid: &str) -> Result<Option<ActivityDocument>> {
        match self.store.hget(&keys::cache(gid), DOCUMENT).await? {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw).map_err(StoreError::Serialization)?,
            )),
            None => Ok(None),
        }
    }

    /// Cache a document unless it is older than the one already cached
    ///
    /// Returns false when the document was stale and nothing was written.
    pub async fn store_document(&self, gid: &str, doc: &ActivityDocument) -> Result<bool> {
        if let Some(current) = self.updated(gid).await? {
            if doc.updated < current {
                return Ok(false);
            }
        }
        let raw = serde_json::to_string(doc).map_err(StoreError::Serialization)?;
        self.store.hset(&keys::cache(gid), DOCUMENT, &raw).await?;
        self.set_stamp(gid, UPDATED, doc.updated).await?;
        self.set_etag(gid, &doc.etag).await?;
        Ok(true)
    }

    /// Count one update at the minute of day of `stamp`
    pub async fn incr_minute_updates(&self, gid: &str, stamp: i64) -> Result<i64> {
        let field = keys::minute_field(minute_of_day(stamp));
        self.store.hincrby(&keys::cache(gid), &field, 1).await
    }

    /// Updates recorded within `spread` minutes of `minute`, wrapping at midnight
    pub async fn num_minute_updates(&self, gid: &str, minute: u32, spread: u32) -> Result<i64> {
        let fields = self.store.hgetall(&keys::cache(gid)).await?;
        let total = fields
            .iter()
            .filter_map(|(field, count)| {
                let m: u32 = field.strip_prefix("m:")?.parse().ok()?;
                (circular_distance(m, minute) <= spread).then(|| count.parse::<i64>().ok())?
            })
            .sum();
        Ok(total)
    }

    /// Requested stamp missing or older than `timeout_s`
    pub async fn is_idle(&self, gid: &str, now: i64, timeout_s: i64) -> Result<bool> {
        Ok(self
            .requested(gid)
            .await?
            .map_or(true, |requested| now - requested > timeout_s))
    }

    pub async fn purge(&self, gid: &str) -> Result<()> {
        self.store.del(&keys::cache(gid)).await
    }
}
