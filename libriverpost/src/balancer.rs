//! Due-set of source accounts
//!
//! The due-set orders every polled account by the epoch of its next poll.
//! Anyone may read it, but only the poll scheduler master writes it: the
//! writing half is the separate [`DueSetWriter`], which is not `Clone` and
//! is handed to exactly one owner.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::bus::{command, Bus};
use crate::error::Result;
use crate::keys;
use crate::store::Store;

pub const DEFAULT_BATCH_LIMIT: usize = 200;

/// Poll counters of one poller instance as stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerStats {
    pub hour: u64,
    pub day: u64,
}

/// Snapshot of the poller side of the system
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsOverview {
    pub due_set: usize,
    pub pollers: Vec<String>,
    pub registration_backlog: usize,
    pub poll_backlog: usize,
}

#[derive(Clone)]
pub struct Balancer {
    store: Arc<dyn Store>,
    bus: Bus,
}

impl Balancer {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let bus = Bus::new(Arc::clone(&store));
        Self { store, bus }
    }

    /// Up to `limit` gids due at or before `epoch`, earliest first
    pub async fn due_before(&self, epoch: i64, limit: usize) -> Result<Vec<String>> {
        let due = self
            .store
            .zrange_by_score(keys::DUE_SET, epoch, Some(limit))
            .await?;
        Ok(due.into_iter().map(|(gid, _)| gid).collect())
    }

    pub async fn score(&self, gid: &str) -> Result<Option<i64>> {
        self.store.zscore(keys::DUE_SET, gid).await
    }

    pub async fn len(&self) -> Result<usize> {
        self.store.zcard(keys::DUE_SET).await
    }

    /// Queue a new account for its first poll
    pub async fn register_gid(&self, gid: &str) -> Result<()> {
        self.store.sadd(keys::REGISTER_SET, gid).await?;
        self.bus
            .send_now(keys::POLLER_ALL, command::REGISTER, &[])
            .await?;
        info!(gid, "Registered account");
        Ok(())
    }

    pub async fn next_registered(&self) -> Result<Option<String>> {
        self.store.spop(keys::REGISTER_SET).await
    }

    pub async fn register_poller(&self, name: &str) -> Result<()> {
        self.store.sadd(keys::POLLER_SET, name).await?;
        Ok(())
    }

    pub async fn unregister_poller(&self, name: &str) -> Result<()> {
        self.store.srem(keys::POLLER_SET, name).await?;
        self.store.del(&keys::worker_stats(name)).await
    }

    pub async fn set_worker_stats(&self, name: &str, stats: WorkerStats) -> Result<()> {
        let key = keys::worker_stats(name);
        self.store.hset(&key, "hour", &stats.hour.to_string()).await?;
        self.store.hset(&key, "day", &stats.day.to_string()).await
    }

    /// Counters of every registered poller
    pub async fn worker_stats(&self) -> Result<BTreeMap<String, WorkerStats>> {
        let mut out = BTreeMap::new();
        for name in self.store.smembers(keys::POLLER_SET).await? {
            let raw = self.store.hgetall(&keys::worker_stats(&name)).await?;
            let field = |f: &str| raw.get(f).and_then(|v| v.parse().ok()).unwrap_or(0);
            out.insert(
                name,
                WorkerStats {
                    hour: field("hour"),
                    day: field("day"),
                },
            );
        }
        Ok(out)
    }

    pub async fn stats_overview(&self) -> Result<StatsOverview> {
        Ok(StatsOverview {
            due_set: self.store.zcard(keys::DUE_SET).await?,
            pollers: self.store.smembers(keys::POLLER_SET).await?,
            registration_backlog: self.store.scard(keys::REGISTER_SET).await?,
            poll_backlog: self.store.llen(keys::POLLER_ALL).await?,
        })
    }
}

/// Mutating half of the due-set
pub struct DueSetWriter {
    store: Arc<dyn Store>,
}

impl DueSetWriter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Insert or move `gid` to `at_epoch`
    pub async fn reschedule(&self, gid: &str, at_epoch: i64) -> Result<()> {
        self.store.zadd(keys::DUE_SET, gid, at_epoch).await
    }

    pub async fn remove(&self, gid: &str) -> Result<()> {
        self.store.zrem(keys::DUE_SET, gid).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Message;
    use crate::store::MemoryStore;

    fn setup() -> (Balancer, DueSetWriter, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        (
            Balancer::new(Arc::clone(&store)),
            DueSetWriter::new(Arc::clone(&store)),
            store,
        )
    }

    #[tokio::test]
    async fn test_due_before_respects_bound_and_limit() {
        let (balancer, writer, _) = setup();
        for i in 0..10 {
            writer.reschedule(&format!("g{}", i), 100 + i).await.unwrap();
        }

        let due = balancer.due_before(104, 200).await.unwrap();
        assert_eq!(due, vec!["g0", "g1", "g2", "g3", "g4"]);

        let limited = balancer.due_before(1000, 3).await.unwrap();
        assert_eq!(limited, vec!["g0", "g1", "g2"]);

        assert!(balancer.due_before(99, 200).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reschedule_moves_entry() {
        let (balancer, writer, _) = setup();
        writer.reschedule("g", 10).await.unwrap();
        writer.reschedule("g", 500).await.unwrap();
        assert_eq!(balancer.score("g").await.unwrap(), Some(500));
        assert!(balancer.due_before(100, 10).await.unwrap().is_empty());
        writer.remove("g").await.unwrap();
        assert_eq!(balancer.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_register_gid_signals_pollers() {
        let (balancer, _, store) = setup();
        store.rpush(keys::POLLER_ALL, "~M~update/1").await.unwrap();
        balancer.register_gid("42").await.unwrap();

        let head = store.lpop(keys::POLLER_ALL).await.unwrap().unwrap();
        assert_eq!(
            Message::parse(&head),
            Message::Command {
                name: "register".to_string(),
                args: vec![]
            }
        );
        assert_eq!(balancer.next_registered().await.unwrap().as_deref(), Some("42"));
        assert_eq!(balancer.next_registered().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_worker_stats_and_overview() {
        let (balancer, writer, _) = setup();
        balancer.register_poller("p1").await.unwrap();
        balancer
            .set_worker_stats("p1", WorkerStats { hour: 5, day: 50 })
            .await
            .unwrap();
        writer.reschedule("g", 1).await.unwrap();

        let stats = balancer.worker_stats().await.unwrap();
        assert_eq!(stats["p1"], WorkerStats { hour: 5, day: 50 });

        let overview = balancer.stats_overview().await.unwrap();
        assert_eq!(overview.due_set, 1);
        assert_eq!(overview.pollers, vec!["p1"]);

        balancer.unregister_poller("p1").await.unwrap();
        assert!(balancer.worker_stats().await.unwrap().is_empty());
    }
}
