//! Bindings between source accounts and destination users
//!
//! A bind touches three indexes: the providers an account publishes to, the
//! users bound per provider, and the reverse list of sources per destination
//! user. Per-link state (first-bound stamp, last delivered content stamp,
//! error counter) lives in its own hash, destination-wide state (last
//! publish, user options) in another.

use std::sync::Arc;
use tracing::info;

use crate::error::{Result, StoreError};
use crate::keys;
use crate::store::Store;
use crate::types::Link;

/// Entries kept in an account's activity log
pub const ACTIVITY_LOG_LEN: usize = 20;

const FIRST_BOUND: &str = "first_bound";
const UPDATED: &str = "updated";
const ERRORS: &str = "errors";
const LAST_PUBLISH: &str = "last_publish";
const PARAM_PREFIX: &str = "param:";

#[derive(Clone)]
pub struct LinkStore {
    store: Arc<dyn Store>,
}

impl LinkStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    async fn int_field(&self, key: &str, field: &str) -> Result<Option<i64>> {
        match self.store.hget(key, field).await? {
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                StoreError::Corrupt {
                    key: format!("{}/{}", key, field),
                    reason: format!("not an integer: {}", raw),
                }
                .into()
            }),
            None => Ok(None),
        }
    }

    /// Bind a destination user to a source account; binding twice is a no-op
    pub async fn bind(&self, link: &Link, now: i64) -> Result<()> {
        self.store
            .sadd(&keys::destinations(&link.gid), &link.provider)
            .await?;
        self.store
            .sadd(&keys::bound_users(&link.gid, &link.provider), &link.user)
            .await?;
        self.store
            .sadd(&keys::sources(&link.provider, &link.user), &link.gid)
            .await?;

        let key = keys::link(link);
        if self.store.hget(&key, FIRST_BOUND).await?.is_none() {
            self.store.hset(&key, FIRST_BOUND, &now.to_string()).await?;
            info!(link = %link, "Bound");
        }
        Ok(())
    }

    /// Remove a binding
    ///
    /// With `purge`, the link's filter and schedule go too, and the
    /// destination's message map once no source is left.
    pub async fn unbind(&self, link: &Link, purge: bool) -> Result<()> {
        let users_key = keys::bound_users(&link.gid, &link.provider);
        self.store.srem(&users_key, &link.user).await?;
        if self.store.scard(&users_key).await? == 0 {
            self.store
                .srem(&keys::destinations(&link.gid), &link.provider)
                .await?;
        }
        let sources_key = keys::sources(&link.provider, &link.user);
        self.store.srem(&sources_key, &link.gid).await?;
        self.store.del(&keys::link(link)).await?;

        if purge {
            self.store
                .hdel(
                    keys::SCHEDULE_STORE,
                    &keys::schedule_field(&link.gid, &link.provider, &link.user),
                )
                .await?;
            self.store
                .hdel(
                    &keys::filters(&link.provider, &link.user),
                    &keys::filter_field(&link.gid),
                )
                .await?;
            if self.store.scard(&sources_key).await? == 0 {
                self.store
                    .del(&keys::message_map(&link.provider, &link.user))
                    .await?;
            }
        }
        info!(link = %link, purge, "Unbound");
        Ok(())
    }

    /// Unbind every source of a destination user; returns how many were removed
    pub async fn forget_destination(&self, provider: &str, user: &str) -> Result<usize> {
        let gids = self.sources(provider, user).await?;
        for gid in &gids {
            self.unbind(&Link::new(gid.as_str(), provider, user), true)
                .await?;
        }
        self.store.del(&keys::destination(provider, user)).await?;
        Ok(gids.len())
    }

    /// Providers the account publishes to
    pub async fn destinations(&self, gid: &str) -> Result<Vec<String>> {
        self.store.smembers(&keys::destinations(gid)).await
    }

    pub async fn destination_users(&self, gid: &str, provider: &str) -> Result<Vec<String>> {
        self.store.smembers(&keys::bound_users(gid, provider)).await
    }

    /// Links of one account on one provider
    pub async fn links(&self, gid: &str, provider: &str) -> Result<Vec<Link>> {
        Ok(self
            .destination_users(gid, provider)
            .await?
            .into_iter()
            .map(|user| Link::new(gid, provider, user))
            .collect())
    }

    pub async fn sources(&self, provider: &str, user: &str) -> Result<Vec<String>> {
        self.store.smembers(&keys::sources(provider, user)).await
    }

    pub async fn is_bound(&self, link: &Link) -> Result<bool> {
        Ok(self.first_bound(link).await?.is_some())
    }

    pub async fn first_bound(&self, link: &Link) -> Result<Option<i64>> {
        self.int_field(&keys::link(link), FIRST_BOUND).await
    }

    /// Content stamp of the last item handled for this link
    pub async fn updated(&self, link: &Link) -> Result<Option<i64>> {
        self.int_field(&keys::link(link), UPDATED).await
    }

    pub async fn set_updated(&self, link: &Link, stamp: i64) -> Result<()> {
        self.store
            .hset(&keys::link(link), UPDATED, &stamp.to_string())
            .await
    }

    pub async fn errors(&self, link: &Link) -> Result<i64> {
        Ok(self.int_field(&keys::link(link), ERRORS).await?.unwrap_or(0))
    }

    pub async fn incr_errors(&self, link: &Link) -> Result<i64> {
        self.store.hincrby(&keys::link(link), ERRORS, 1).await
    }

    pub async fn reset_errors(&self, link: &Link) -> Result<()> {
        self.store.hdel(&keys::link(link), ERRORS).await.map(|_| ())
    }

    pub async fn last_publish(&self, provider: &str, user: &str) -> Result<Option<i64>> {
        self.int_field(&keys::destination(provider, user), LAST_PUBLISH)
            .await
    }

    pub async fn set_last_publish(&self, provider: &str, user: &str, now: i64) -> Result<()> {
        self.store
            .hset(&keys::destination(provider, user), LAST_PUBLISH, &now.to_string())
            .await
    }

    /// Destination user option such as `in_cty` or `time_space_min`
    pub async fn user_param(&self, provider: &str, user: &str, name: &str) -> Result<Option<String>> {
        self.store
            .hget(
                &keys::destination(provider, user),
                &format!("{}{}", PARAM_PREFIX, name),
            )
            .await
    }

    pub async fn set_user_param(&self, provider: &str, user: &str, name: &str, value: &str) -> Result<()> {
        self.store
            .hset(
                &keys::destination(provider, user),
                &format!("{}{}", PARAM_PREFIX, name),
                value,
            )
            .await
    }

    /// Prepend an entry to the account's activity log
    pub async fn add_log(&self, gid: &str, now: i64, message: &str) -> Result<()> {
        let key = keys::activity_log(gid);
        self.store.lpush(&key, &format!("{} {}", now, message)).await?;
        self.store.ltrim(&key, ACTIVITY_LOG_LEN).await
    }

    /// Newest entries first
    pub async fn logs(&self, gid: &str) -> Result<Vec<String>> {
        self.store
            .lrange(&keys::activity_log(gid), ACTIVITY_LOG_LEN)
            .await
    }
}
