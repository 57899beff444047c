//! Poll scheduler master
//!
//! The only writer of the due-set. Each round pulls the accounts due within
//! half a period, pushes their next poll forward by the poll interval and
//! broadcasts `update` to the poll workers. When a worker reports back on
//! `poller:all-out` the account gets its real next poll time: the poll
//! interval, plus the quiet-time penalty when the account has never been
//! active around this time of day.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::poll_worker::PollWorkerFactory;
use super::{now, Service, ServiceContext, ServiceKind};
use crate::balancer::{Balancer, DueSetWriter, WorkerStats};
use crate::bus::{command, Bus, Handler, Listener, StopHandle};
use crate::cache::{minute_of_day, AccountCache};
use crate::config::PollerConfig;
use crate::error::Result;
use crate::keys;
use crate::links::LinkStore;
use crate::providers::ContentFetcher;
use crate::supervisor::Supervisor;

const HOUR_S: i64 = 3600;
const DAY_S: i64 = 86_400;

/// Hour and day poll counters of one master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThroughputStats {
    hour: (i64, u64),
    day: (i64, u64),
}

impl ThroughputStats {
    pub fn new(now: i64) -> Self {
        Self {
            hour: (now, 0),
            day: (now, 0),
        }
    }

    /// Count `polls` dispatched at `now`, starting a new window when one lapsed
    pub fn record(&mut self, now: i64, polls: u64) -> WorkerStats {
        if now - self.hour.0 > HOUR_S {
            self.hour = (now, 0);
        }
        if now - self.day.0 > DAY_S {
            self.day = (now, 0);
        }
        self.hour.1 += polls;
        self.day.1 += polls;
        self.snapshot()
    }

    pub fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            hour: self.hour.1,
            day: self.day.1,
        }
    }
}

pub struct PollScheduler {
    name: String,
    channel: String,
    balancer: Balancer,
    due_set: DueSetWriter,
    cache: AccountCache,
    links: LinkStore,
    bus: Bus,
    supervisor: Arc<Supervisor>,
    config: PollerConfig,
    stats: ThroughputStats,
}

impl PollScheduler {
    pub fn new(ctx: &ServiceContext, supervisor: Arc<Supervisor>, now: i64) -> Self {
        let store = &ctx.store;
        Self {
            name: ctx.name.clone(),
            channel: keys::poller_channel(&ctx.name),
            balancer: Balancer::new(Arc::clone(store)),
            due_set: DueSetWriter::new(Arc::clone(store)),
            cache: AccountCache::new(Arc::clone(store)),
            links: LinkStore::new(Arc::clone(store)),
            bus: Bus::new(Arc::clone(store)),
            supervisor,
            config: ctx.config.poller.clone(),
            stats: ThroughputStats::new(now),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.snapshot()
    }

    /// Add an account to the due-set for a poll at `at`
    pub async fn schedule(&self, gid: &str, at: i64) -> Result<()> {
        self.due_set.reschedule(gid, at).await
    }

    /// Dispatch every account due around `now`; returns how many were sent
    pub async fn schedule_next_batch(&mut self, now: i64, allow_worker_start: bool) -> Result<usize> {
        let half_period = (self.config.period.as_secs() / 2) as i64;
        let poll_interval = self.config.poll_interval.as_secs() as i64;
        let mut dispatched = 0;
        let mut claimed: HashSet<String> = HashSet::new();

        loop {
            let batch = self
                .balancer
                .due_before(now + half_period, self.config.batch_limit)
                .await?;
            if batch.is_empty() {
                break;
            }
            if allow_worker_start {
                self.supervisor
                    .scale_up_if(batch.len(), self.config.gid_set_threshold)
                    .await;
            }
            info!(poller = %self.name, count = batch.len(), "Invoking poll");

            let mut sent = 0;
            let mut fresh = 0;
            for gid in &batch {
                if !claimed.insert(gid.clone()) {
                    continue;
                }
                fresh += 1;
                if self.is_orphan(gid, now).await? {
                    info!(poller = %self.name, gid = %gid, "Dropping orphan");
                    self.cache.purge(gid).await?;
                    self.due_set.remove(gid).await?;
                    continue;
                }
                // Move the next poll first so the gid is not dispatched twice
                self.due_set.reschedule(gid, now + poll_interval).await?;
                self.bus
                    .send(keys::POLLER_ALL, command::UPDATE, &[gid])
                    .await?;
                sent += 1;
            }

            let stats = self.stats.record(now, sent as u64);
            self.balancer.set_worker_stats(&self.name, stats).await?;
            dispatched += sent;

            // Rescheduled gids still inside the window come back; stop once a batch is all repeats
            if batch.len() < self.config.batch_limit || fresh == 0 {
                break;
            }
        }

        if dispatched == 0 {
            debug!(poller = %self.name, "Nothing due");
        }
        Ok(dispatched)
    }

    async fn is_orphan(&self, gid: &str, now: i64) -> Result<bool> {
        let timeout = self.config.orphan_timeout.as_secs() as i64;
        Ok(self.cache.is_idle(gid, now, timeout).await?
            && self.links.destinations(gid).await?.is_empty())
    }

    /// Reschedule an account whose poll just finished; returns the next poll epoch
    pub async fn on_poll_complete(&self, gid: &str, now: i64) -> Result<i64> {
        let mut next = now + self.config.poll_interval.as_secs() as i64;
        match self
            .cache
            .num_minute_updates(gid, minute_of_day(now), self.config.activity_spread_min)
            .await
        {
            Ok(0) => next += self.config.no_poll_interval.as_secs() as i64,
            Ok(_) => {}
            Err(e) => error!(poller = %self.name, gid, error = %e, "Could not read activity"),
        }
        self.due_set.reschedule(gid, next).await?;
        debug!(poller = %self.name, gid, next, "Rescheduled");
        Ok(next)
    }

    async fn run_batch(&mut self, allow_worker_start: bool) -> Result<()> {
        if let Err(e) = self.schedule_next_batch(now(), allow_worker_start).await {
            error!(poller = %self.name, error = %e, "Batch failed, unregistering");
            self.balancer.unregister_poller(&self.name).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Handler for PollScheduler {
    async fn on_raw(&mut self, channel: &str, payload: &str) -> Result<()> {
        if channel == keys::POLLER_ALL_OUT {
            let gid = payload.trim();
            if gid.is_empty() {
                return Ok(());
            }
            return self.on_poll_complete(gid, now()).await.map(|_| ());
        }
        if channel == self.channel {
            return self.run_batch(false).await;
        }
        debug!(channel, payload, "Ignoring raw message");
        Ok(())
    }

    async fn on_timeout(&mut self) -> Result<()> {
        self.run_batch(true).await
    }

    async fn on_exit(&mut self, _channel: &str, stop: &StopHandle) -> Result<()> {
        warn!(poller = %self.name, "Poller master terminating listener...");
        stop.stop();
        self.supervisor.on_terminate().await;
        Ok(())
    }
}

pub struct PollerService {
    ctx: ServiceContext,
    listener: Listener,
    supervisor: Arc<Supervisor>,
}

impl PollerService {
    pub fn new(ctx: ServiceContext, fetcher: Arc<dyn ContentFetcher>) -> Self {
        let config = &ctx.config.poller;
        let listener = Listener::new(Bus::new(Arc::clone(&ctx.store)));
        let factory = Arc::new(PollWorkerFactory::new(
            Arc::clone(&ctx.store),
            fetcher,
            config.clone(),
        ));
        let supervisor = Supervisor::new(&ctx.name, keys::poller_channel(&ctx.name), listener.clone())
            .with_workers(factory, config.workers_min, config.workers_max)
            .with_join_timeout(config.join_timeout);
        Self {
            ctx,
            listener,
            supervisor: Arc::new(supervisor),
        }
    }
}

#[async_trait]
impl Service for PollerService {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Poller
    }

    fn supervisor(&self) -> Arc<Supervisor> {
        Arc::clone(&self.supervisor)
    }

    async fn run(&self) -> Result<()> {
        let config = &self.ctx.config.poller;
        info!(
            name = %self.ctx.name,
            poll_interval = ?config.poll_interval,
            period = ?config.period,
            "Poller starting..."
        );

        let balancer = Balancer::new(Arc::clone(&self.ctx.store));
        balancer.register_poller(&self.ctx.name).await?;
        self.supervisor.start().await?;

        let mut scheduler = PollScheduler::new(&self.ctx, Arc::clone(&self.supervisor), now());
        let own = keys::poller_channel(&self.ctx.name);
        // Immediate first round
        self.listener
            .bus()
            .send_raw(&own, keys::WAKE_PAYLOAD)
            .await?;

        let channels = vec![keys::POLLER_ALL_OUT.to_string(), own];
        let result = self
            .listener
            .listen(&channels, &mut scheduler, config.period)
            .await;
        warn!(name = %self.ctx.name, "Poller master listener exit");

        balancer.unregister_poller(&self.ctx.name).await?;
        self.supervisor.abort_remaining().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Message;
    use crate::config::Config;
    use crate::providers::mock::MockFetcher;
    use crate::store::{MemoryStore, Store};
    use crate::types::Link;
    use std::time::Duration;

    const NOW: i64 = 1_704_103_200;

    fn setup(config: Config) -> (PollScheduler, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let ctx = ServiceContext::new("poller", Arc::clone(&store), config);
        let service = PollerService::new(ctx.clone(), Arc::new(MockFetcher::new()));
        (PollScheduler::new(&ctx, service.supervisor(), NOW), store)
    }

    async fn bound(store: &Arc<dyn Store>, gid: &str) {
        LinkStore::new(Arc::clone(store))
            .bind(&Link::new(gid, "twitter", "u"), 0)
            .await
            .unwrap();
    }

    #[test]
    fn test_throughput_windows_reset() {
        let mut stats = ThroughputStats::new(0);
        assert_eq!(stats.record(10, 5), WorkerStats { hour: 5, day: 5 });
        assert_eq!(stats.record(3000, 2), WorkerStats { hour: 7, day: 7 });
        assert_eq!(stats.record(3700, 1), WorkerStats { hour: 1, day: 8 });
        assert_eq!(stats.record(90_000, 4), WorkerStats { hour: 4, day: 4 });
    }

    #[tokio::test]
    async fn test_batch_dispatches_due_accounts() {
        let (mut scheduler, store) = setup(Config::default());
        Balancer::new(Arc::clone(&store))
            .register_poller("poller")
            .await
            .unwrap();
        for (gid, at) in [("a", NOW - 10), ("b", NOW + 1), ("c", NOW + 100)] {
            bound(&store, gid).await;
            scheduler.schedule(gid, at).await.unwrap();
        }

        assert_eq!(scheduler.schedule_next_batch(NOW, false).await.unwrap(), 2);

        let balancer = Balancer::new(Arc::clone(&store));
        assert_eq!(balancer.score("a").await.unwrap(), Some(NOW + 600));
        assert_eq!(balancer.score("b").await.unwrap(), Some(NOW + 600));
        assert_eq!(balancer.score("c").await.unwrap(), Some(NOW + 100));

        let mut sent = Vec::new();
        while let Some(raw) = store.lpop(keys::POLLER_ALL).await.unwrap() {
            sent.push(Message::parse(&raw));
        }
        assert_eq!(
            sent,
            vec![
                Message::Command {
                    name: "update".to_string(),
                    args: vec!["a".to_string()]
                },
                Message::Command {
                    name: "update".to_string(),
                    args: vec!["b".to_string()]
                },
            ]
        );
        assert_eq!(scheduler.stats(), WorkerStats { hour: 2, day: 2 });
        assert_eq!(
            balancer.worker_stats().await.unwrap().get("poller"),
            Some(&WorkerStats { hour: 2, day: 2 })
        );
    }

    #[tokio::test]
    async fn test_batch_drains_beyond_limit() {
        let mut config = Config::default();
        config.poller.batch_limit = 3;
        let (mut scheduler, store) = setup(config);
        for i in 0..7 {
            let gid = format!("g{}", i);
            bound(&store, &gid).await;
            scheduler.schedule(&gid, NOW - i).await.unwrap();
        }
        assert_eq!(scheduler.schedule_next_batch(NOW, false).await.unwrap(), 7);
        assert_eq!(store.llen(keys::POLLER_ALL).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_full_batch_of_repeats_ends_the_tick() {
        // Rescheduled gids land back inside the window of the same tick
        let mut config = Config::default();
        config.poller.batch_limit = 2;
        config.poller.period = Duration::from_secs(10);
        config.poller.poll_interval = Duration::from_secs(1);
        let (mut scheduler, store) = setup(config);
        for gid in ["a", "b"] {
            bound(&store, gid).await;
            scheduler.schedule(gid, NOW - 1).await.unwrap();
        }

        assert_eq!(scheduler.schedule_next_batch(NOW, false).await.unwrap(), 2);
        assert_eq!(store.llen(keys::POLLER_ALL).await.unwrap(), 2);
        assert_eq!(
            Balancer::new(Arc::clone(&store)).score("a").await.unwrap(),
            Some(NOW + 1)
        );
    }

    #[tokio::test]
    async fn test_orphans_are_dropped() {
        let (mut scheduler, store) = setup(Config::default());
        let cache = AccountCache::new(Arc::clone(&store));

        scheduler.schedule("orphan", NOW - 1).await.unwrap();
        cache.set_requested("orphan", NOW - 7200).await.unwrap();
        // Recently requested: kept even without destinations
        scheduler.schedule("fresh", NOW - 1).await.unwrap();
        cache.set_requested("fresh", NOW - 60).await.unwrap();

        assert_eq!(scheduler.schedule_next_batch(NOW, false).await.unwrap(), 1);
        let balancer = Balancer::new(Arc::clone(&store));
        assert_eq!(balancer.score("orphan").await.unwrap(), None);
        assert_eq!(cache.requested("orphan").await.unwrap(), None);
        assert!(balancer.score("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_completion_adds_quiet_penalty() {
        let (scheduler, store) = setup(Config::default());
        let cache = AccountCache::new(Arc::clone(&store));

        // No activity at all around this time of day
        assert_eq!(
            scheduler.on_poll_complete("quiet", NOW).await.unwrap(),
            NOW + 600 + 1800
        );

        // Active an hour earlier, inside the 90 minute window
        cache.incr_minute_updates("busy", NOW - 3600).await.unwrap();
        assert_eq!(scheduler.on_poll_complete("busy", NOW).await.unwrap(), NOW + 600);

        // Active three hours earlier only: outside the window
        cache.incr_minute_updates("late", NOW - 3 * 3600).await.unwrap();
        assert_eq!(
            scheduler.on_poll_complete("late", NOW).await.unwrap(),
            NOW + 2400
        );
        assert_eq!(
            Balancer::new(store).score("busy").await.unwrap(),
            Some(NOW + 600)
        );
    }

    #[tokio::test]
    async fn test_completion_message_reschedules() {
        let (mut scheduler, store) = setup(Config::default());
        scheduler
            .on_raw(keys::POLLER_ALL_OUT, "g9")
            .await
            .unwrap();
        assert!(Balancer::new(store).score("g9").await.unwrap().is_some());
    }
}
