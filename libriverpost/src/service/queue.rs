//! Queue sweeper
//!
//! Wakes about once a period, takes every buffer entry due within half a
//! period and re-injects it as `publish` on the provider's channel. The
//! period is jittered by up to 10 % so several sweepers drift apart.

use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{now, Service, ServiceContext, ServiceKind};
use crate::buffer::{Buffer, BufferEntry};
use crate::bus::{command, Bus, Handler, Listener, StopHandle};
use crate::error::Result;
use crate::keys;
use crate::supervisor::Supervisor;

/// Random period in `[0.9, 1.1) * base`
pub fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..1.1);
    base.mul_f64(factor)
}

pub struct QueueSweeper {
    name: String,
    buffer: Buffer,
    bus: Bus,
    period: Duration,
    supervisor: Arc<Supervisor>,
}

impl QueueSweeper {
    pub fn new(ctx: &ServiceContext, supervisor: Arc<Supervisor>) -> Self {
        Self {
            name: ctx.name.clone(),
            buffer: Buffer::new(Arc::clone(&ctx.store)),
            bus: Bus::new(Arc::clone(&ctx.store)),
            period: ctx.config.queue.period,
            supervisor,
        }
    }

    /// Re-inject due entries; returns them
    pub async fn sweep(&self, now: i64) -> Result<Vec<BufferEntry>> {
        let lookahead = (self.period.as_secs() / 2) as i64;
        let entries = self.buffer.due_entries(lookahead, now).await?;
        if !entries.is_empty() {
            info!(queue = %self.name, count = entries.len(), "Due items");
        }
        for entry in &entries {
            debug!(queue = %self.name, gid = %entry.gid, provider = %entry.provider, "Notifying");
            self.bus
                .send(
                    &keys::publisher_channel(&entry.provider),
                    command::PUBLISH,
                    &[&entry.gid],
                )
                .await?;
        }
        Ok(entries)
    }
}

#[async_trait]
impl Handler for QueueSweeper {
    async fn on_timeout(&mut self) -> Result<()> {
        self.sweep(now()).await.map(|_| ())
    }

    async fn on_raw(&mut self, _channel: &str, _payload: &str) -> Result<()> {
        self.sweep(now()).await.map(|_| ())
    }

    async fn on_exit(&mut self, _channel: &str, stop: &StopHandle) -> Result<()> {
        warn!(queue = %self.name, "Queue terminating");
        stop.stop();
        self.supervisor.on_terminate().await;
        Ok(())
    }

    fn next_timeout(&self, base: Duration) -> Duration {
        jittered(base)
    }
}

pub struct QueueService {
    ctx: ServiceContext,
    listener: Listener,
    supervisor: Arc<Supervisor>,
}

impl QueueService {
    pub fn new(ctx: ServiceContext) -> Self {
        let listener = Listener::new(Bus::new(Arc::clone(&ctx.store)));
        let supervisor = Supervisor::new(&ctx.name, keys::queue_channel(&ctx.name), listener.clone());
        Self {
            ctx,
            listener,
            supervisor: Arc::new(supervisor),
        }
    }
}

#[async_trait]
impl Service for QueueService {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Queue
    }

    fn supervisor(&self) -> Arc<Supervisor> {
        Arc::clone(&self.supervisor)
    }

    async fn run(&self) -> Result<()> {
        let period = self.ctx.config.queue.period;
        info!(name = %self.ctx.name, period = ?period, "Queue starting...");
        self.supervisor.start().await?;

        let mut sweeper = QueueSweeper::new(&self.ctx, Arc::clone(&self.supervisor));
        let channels = vec![keys::queue_channel(&self.ctx.name), keys::QUEUE_ALL.to_string()];
        let result = self.listener.listen(&channels, &mut sweeper, period).await;
        warn!(name = %self.ctx.name, "Queue listener exit");
        result
    }
}
