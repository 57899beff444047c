//! Message-identity map
//!
//! For every destination user we remember, per content item, what happened
//! the last time it was sent: the provider's message id on success, or the
//! retry count and a fingerprint of the token used on failure. This is what
//! turns a re-polled item into a duplicate, an edit or a retry.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::error::{Result, StoreError};
use crate::keys;
use crate::store::Store;

/// Failed items with more retries than this are given up on
pub const MAX_ITEM_RETRIES: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Delivery {
    Delivered { message_id: String },
    Failed { retries: u32, token_fingerprint: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    #[serde(flatten)]
    pub delivery: Delivery,
    /// Content stamp of the item when it was handled
    pub updated: i64,
}

/// What to do with an item given its previous record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriorAttempt {
    New,
    Retry { retries: u32 },
    PermanentlyFailed,
    Duplicate,
    Edit { message_id: String },
}

/// Short, non-reversible token identity
pub fn token_fingerprint(token: &SecretString) -> String {
    let digest = Sha256::digest(token.expose_secret().as_bytes());
    digest
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect()
}

pub fn classify(record: Option<&MessageRecord>, item_updated: i64, fingerprint: &str) -> PriorAttempt {
    match record {
        None => PriorAttempt::New,
        Some(MessageRecord {
            delivery:
                Delivery::Failed {
                    retries,
                    token_fingerprint,
                },
            ..
        }) => {
            // A new token gets a clean slate
            let retries = if token_fingerprint == fingerprint { *retries } else { 0 };
            if retries > MAX_ITEM_RETRIES {
                PriorAttempt::PermanentlyFailed
            } else {
                PriorAttempt::Retry { retries }
            }
        }
        Some(MessageRecord {
            delivery: Delivery::Delivered { message_id },
            updated,
        }) => {
            if *updated == item_updated {
                PriorAttempt::Duplicate
            } else {
                PriorAttempt::Edit {
                    message_id: message_id.clone(),
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct MessageMapStore {
    store: Arc<dyn Store>,
    max_entries: usize,
}

impl MessageMapStore {
    pub fn new(store: Arc<dyn Store>, max_entries: usize) -> Self {
        Self { store, max_entries }
    }

    pub async fn get(&self, provider: &str, user: &str, item_id: &str) -> Result<Option<MessageRecord>> {
        match self
            .store
            .hget(&keys::message_map(provider, user), item_id)
            .await?
        {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw).map_err(StoreError::Serialization)?,
            )),
            None => Ok(None),
        }
    }

    /// Record an outcome and evict the oldest entries beyond the bound
    pub async fn record(
        &self,
        provider: &str,
        user: &str,
        item_id: &str,
        record: &MessageRecord,
    ) -> Result<()> {
        let key = keys::message_map(provider, user);
        let raw = serde_json::to_string(record).map_err(StoreError::Serialization)?;
        self.store.hset(&key, item_id, &raw).await?;
        self.evict(&key).await
    }

    pub async fn len(&self, provider: &str, user: &str) -> Result<usize> {
        Ok(self.store.hgetall(&keys::message_map(provider, user)).await?.len())
    }

    async fn evict(&self, key: &str) -> Result<()> {
        let all = self.store.hgetall(key).await?;
        if all.len() <= self.max_entries {
            return Ok(());
        }

        // Unreadable entries sort first and are evicted first
        let mut by_age: Vec<(i64, String)> = all
            .into_iter()
            .map(|(item_id, raw)| {
                let updated = serde_json::from_str::<MessageRecord>(&raw)
                    .map(|r| r.updated)
                    .unwrap_or(i64::MIN);
                (updated, item_id)
            })
            .collect();
        by_age.sort();

        let excess = by_age.len() - self.max_entries;
        for (_, item_id) in by_age.into_iter().take(excess) {
            self.store.hdel(key, &item_id).await?;
        }
        Ok(())
    }
}
