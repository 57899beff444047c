//! Poll worker
//!
//! Listens on `poller:all` and its own channel. Handles:
//!
//! - `update gid[,gid...]`: fetch, cache and fan out `publish` commands
//! - `validate in_list out_list`: resolve account names
//! - `register`: poll newly registered accounts right away
//!
//! A finished poll is reported by pushing the bare gid on `poller:all-out`,
//! where the master reschedules it.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::now;
use crate::balancer::Balancer;
use crate::bus::{command, Bus, Handler, Listener, StopHandle};
use crate::cache::AccountCache;
use crate::config::PollerConfig;
use crate::error::{Result, RiverError};
use crate::keys;
use crate::links::LinkStore;
use crate::providers::ContentFetcher;
use crate::store::Store;
use crate::supervisor::WorkerFactory;

/// Result of polling one account
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The source returned nothing
    Empty,
    /// Same etag as last time
    NotModified,
    /// Older than the cached document
    Stale,
    /// Cached; `publish` went to these providers
    Updated { providers: Vec<String> },
}

pub struct PollWorker {
    name: String,
    bus: Bus,
    cache: AccountCache,
    links: LinkStore,
    balancer: Balancer,
    fetcher: Arc<dyn ContentFetcher>,
    max_results: u32,
}

impl PollWorker {
    pub fn new(name: &str, store: Arc<dyn Store>, fetcher: Arc<dyn ContentFetcher>, config: &PollerConfig) -> Self {
        Self {
            name: name.to_string(),
            bus: Bus::new(Arc::clone(&store)),
            cache: AccountCache::new(Arc::clone(&store)),
            links: LinkStore::new(Arc::clone(&store)),
            balancer: Balancer::new(store),
            fetcher,
            max_results: config.max_results,
        }
    }

    pub fn channels(&self) -> Vec<String> {
        vec![keys::POLLER_ALL.to_string(), keys::poller_channel(&self.name)]
    }

    /// Poll one account and hand new content to the publishers
    pub async fn poll(&self, gid: &str, now: i64) -> Result<PollOutcome> {
        let max_results = self.cache.max_results(gid, self.max_results).await?;
        self.cache.set_poll_stamp(gid, now).await?;

        let Some(doc) = self.fetcher.fetch(gid, max_results).await? else {
            debug!(worker = %self.name, gid, "Nothing fetched");
            return Ok(PollOutcome::Empty);
        };

        if !doc.etag.is_empty() && self.cache.etag(gid).await?.as_deref() == Some(doc.etag.as_str()) {
            debug!(worker = %self.name, gid, "Not modified");
            return Ok(PollOutcome::NotModified);
        }

        let previous = self.cache.updated(gid).await?;
        if !self.cache.store_document(gid, &doc).await? {
            warn!(worker = %self.name, gid, updated = doc.updated, "Fetched document is older than the cache");
            return Ok(PollOutcome::Stale);
        }

        match previous {
            None => {
                // First sighting: seed the histogram with everything we have
                for item in &doc.items {
                    self.cache.incr_minute_updates(gid, item.updated).await?;
                }
                self.cache.incr_minute_updates(gid, now).await?;
            }
            Some(prev) => {
                for item in doc.items.iter().filter(|i| i.updated > prev) {
                    self.cache.incr_minute_updates(gid, item.updated).await?;
                }
            }
        }

        if previous.is_some_and(|prev| doc.updated <= prev) {
            return Ok(PollOutcome::Updated { providers: Vec::new() });
        }

        let providers = self.links.destinations(gid).await?;
        for provider in &providers {
            self.bus
                .send(&keys::publisher_channel(provider), command::PUBLISH, &[gid])
                .await?;
        }
        info!(worker = %self.name, gid, items = doc.items.len(), providers = ?providers, "Updated");
        Ok(PollOutcome::Updated { providers })
    }

    async fn on_update(&self, gids: &str) -> Result<()> {
        let gids: Vec<&str> = gids.split(',').map(str::trim).filter(|g| !g.is_empty()).collect();
        if gids.is_empty() {
            warn!(worker = %self.name, "Empty update skipped");
            return Ok(());
        }

        for gid in gids {
            match self.poll(gid, now()).await {
                Ok(outcome) => debug!(worker = %self.name, gid, outcome = ?outcome, "Polled"),
                Err(e @ RiverError::Store(_)) => return Err(e),
                Err(e) if e.is_transient() => {
                    warn!(worker = %self.name, gid, error = %e, "Poll failed, retrying");
                    self.bus
                        .send(keys::POLLER_ALL, command::UPDATE, &[gid])
                        .await?;
                    continue;
                }
                Err(e) => error!(worker = %self.name, gid, error = %e, "Poll failed"),
            }
            self.bus.send_raw(keys::POLLER_ALL_OUT, gid).await?;
        }
        Ok(())
    }

    /// Resolve every name queued on `in_list`, pushing `name:gid` to `out_list`
    pub async fn validate(&self, in_list: &str, out_list: &str) -> Result<usize> {
        let store = self.bus.store();
        let mut count = 0;
        while let Some(name) = store.lpop(in_list).await? {
            info!(worker = %self.name, name = %name, "Validating account name");
            let gid = self.fetcher.validate_user(&name).await?.unwrap_or_default();
            store.rpush(out_list, &format!("{}:{}", name, gid)).await?;
            count += 1;
        }
        Ok(count)
    }

    /// Drain the registration set into immediate polls on our own channel
    pub async fn register(&self, now: i64) -> Result<usize> {
        let own = keys::poller_channel(&self.name);
        let mut count = 0;
        while let Some(gid) = self.balancer.next_registered().await? {
            info!(worker = %self.name, gid = %gid, "Registering account");
            self.cache.set_requested(&gid, now).await?;
            self.bus.send(&own, command::UPDATE, &[&gid]).await?;
            count += 1;
        }
        Ok(count)
    }
}

#[async_trait]
impl Handler for PollWorker {
    async fn on_command(&mut self, channel: &str, name: &str, args: &[String]) -> Result<()> {
        match (name, args) {
            (command::UPDATE, [gids, ..]) => self.on_update(gids).await,
            (command::VALIDATE, [in_list, out_list, ..]) => {
                self.validate(in_list, out_list).await.map(|_| ())
            }
            (command::REGISTER, _) => self.register(now()).await.map(|_| ()),
            _ => {
                warn!(worker = %self.name, channel, command = name, args = ?args, "Unexpected command");
                Ok(())
            }
        }
    }

    async fn on_exit(&mut self, _channel: &str, stop: &StopHandle) -> Result<()> {
        warn!(worker = %self.name, "Poll worker exiting");
        stop.stop();
        Ok(())
    }
}

/// Spawns [`PollWorker`] tasks for the poller supervisor
pub struct PollWorkerFactory {
    store: Arc<dyn Store>,
    fetcher: Arc<dyn ContentFetcher>,
    config: PollerConfig,
}

impl PollWorkerFactory {
    pub fn new(store: Arc<dyn Store>, fetcher: Arc<dyn ContentFetcher>, config: PollerConfig) -> Self {
        Self {
            store,
            fetcher,
            config,
        }
    }
}

impl WorkerFactory for PollWorkerFactory {
    fn channel(&self, name: &str) -> String {
        keys::poller_channel(name)
    }

    fn spawn(&self, name: String) -> JoinHandle<()> {
        let mut worker = PollWorker::new(&name, Arc::clone(&self.store), Arc::clone(&self.fetcher), &self.config);
        let listener = Listener::new(Bus::new(Arc::clone(&self.store)));
        let timeout = self.config.period.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let channels = worker.channels();
            if let Err(e) = listener.listen(&channels, &mut worker, timeout).await {
                error!(worker = %name, error = %e, "Poll worker failed");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Message;
    use crate::providers::mock::MockFetcher;
    use crate::store::MemoryStore;
    use crate::types::{ActivityDocument, ContentItem, Link};

    const NOW: i64 = 1_704_103_200;

    fn doc(etag: &str, stamps: &[i64]) -> ActivityDocument {
        ActivityDocument {
            etag: etag.to_string(),
            updated: stamps.iter().copied().max().unwrap_or(0),
            items: stamps
                .iter()
                .map(|s| ContentItem {
                    id: format!("i{}", s),
                    updated: *s,
                    published: *s,
                    ..Default::default()
                })
                .collect(),
        }
    }

    fn setup() -> (PollWorker, Arc<MockFetcher>, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(MockFetcher::new());
        let worker = PollWorker::new(
            "poller.000P",
            Arc::clone(&store),
            Arc::clone(&fetcher) as Arc<dyn ContentFetcher>,
            &PollerConfig::default(),
        );
        (worker, fetcher, store)
    }

    async fn drain(store: &Arc<dyn Store>, key: &str) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(raw) = store.lpop(key).await.unwrap() {
            out.push(Message::parse(&raw));
        }
        out
    }

    #[tokio::test]
    async fn test_poll_caches_and_fans_out() {
        let (worker, fetcher, store) = setup();
        LinkStore::new(Arc::clone(&store))
            .bind(&Link::new("g1", "twitter", "alice"), 0)
            .await
            .unwrap();
        fetcher.set_document("g1", doc("e1", &[NOW - 120, NOW - 60]));

        let outcome = worker.poll("g1", NOW).await.unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Updated {
                providers: vec!["twitter".to_string()]
            }
        );

        let cache = AccountCache::new(Arc::clone(&store));
        assert_eq!(cache.updated("g1").await.unwrap(), Some(NOW - 60));
        assert_eq!(cache.poll_stamp("g1").await.unwrap(), Some(NOW));
        // Two items plus the first-sighting mark
        assert_eq!(
            cache
                .num_minute_updates("g1", crate::cache::minute_of_day(NOW), 5)
                .await
                .unwrap(),
            3
        );
        assert_eq!(
            drain(&store, "publisher:twitter").await,
            vec![Message::Command {
                name: "publish".to_string(),
                args: vec!["g1".to_string()]
            }]
        );
    }

    #[tokio::test]
    async fn test_same_etag_is_not_modified() {
        let (worker, fetcher, _) = setup();
        fetcher.set_document("g1", doc("e1", &[NOW - 60]));
        worker.poll("g1", NOW).await.unwrap();
        assert_eq!(worker.poll("g1", NOW + 600).await.unwrap(), PollOutcome::NotModified);
    }

    #[tokio::test]
    async fn test_older_document_is_ignored() {
        let (worker, fetcher, store) = setup();
        fetcher.set_document("g1", doc("e2", &[NOW - 60]));
        worker.poll("g1", NOW).await.unwrap();
        fetcher.set_document("g1", doc("e1", &[NOW - 600]));
        assert_eq!(worker.poll("g1", NOW + 600).await.unwrap(), PollOutcome::Stale);
        assert_eq!(
            AccountCache::new(store).updated("g1").await.unwrap(),
            Some(NOW - 60)
        );
    }

    #[tokio::test]
    async fn test_update_reports_completion_or_retries() {
        let (mut worker, fetcher, store) = setup();
        fetcher.set_document("g1", doc("e1", &[NOW]));
        fetcher.set_unavailable("g2", true);

        worker
            .on_command("poller:all", "update", &["g1,g2".to_string()])
            .await
            .unwrap();

        assert_eq!(
            drain(&store, keys::POLLER_ALL_OUT).await,
            vec![Message::Raw("g1".to_string())]
        );
        assert_eq!(
            drain(&store, keys::POLLER_ALL).await,
            vec![Message::Command {
                name: "update".to_string(),
                args: vec!["g2".to_string()]
            }]
        );
    }

    #[tokio::test]
    async fn test_validate_names() {
        let (worker, fetcher, store) = setup();
        fetcher.add_user("alice", "111");
        store.rpush("in", "alice").await.unwrap();
        store.rpush("in", "nobody").await.unwrap();

        assert_eq!(worker.validate("in", "out").await.unwrap(), 2);
        assert_eq!(
            store.lrange("out", 10).await.unwrap(),
            vec!["alice:111", "nobody:"]
        );
    }

    #[tokio::test]
    async fn test_register_drains_set() {
        let (worker, _, store) = setup();
        let balancer = Balancer::new(Arc::clone(&store));
        balancer.register_gid("g1").await.unwrap();
        balancer.register_gid("g2").await.unwrap();

        assert_eq!(worker.register(NOW).await.unwrap(), 2);
        let queued = drain(&store, "poller:poller.000P").await;
        assert_eq!(queued.len(), 2);
        assert!(!AccountCache::new(store)
            .is_idle("g1", NOW, 3600)
            .await
            .unwrap());
    }
}
