//! Misc service: mail workers
//!
//! Workers take `mail.send gid template [json]` from `mail:all` (or their
//! own channel) and hand the template defaults merged with the JSON
//! parameters to the [`Notifier`].

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{Service, ServiceContext, ServiceKind};
use crate::bus::{command, Bus, Handler, Listener, StopHandle};
use crate::error::{Result, RiverError};
use crate::keys;
use crate::providers::Notifier;
use crate::store::Store;
use crate::supervisor::{Supervisor, WorkerFactory};
use crate::types::MailTemplate;

pub struct MailWorker {
    name: String,
    notifier: Arc<dyn Notifier>,
}

impl MailWorker {
    pub fn new(name: &str, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            name: name.to_string(),
            notifier,
        }
    }

    pub fn channels(&self) -> Vec<String> {
        vec![keys::mail_channel(&self.name), keys::MAIL_ALL.to_string()]
    }

    /// `args`: gid, template name, then the JSON parameters split on `/`
    pub async fn send(&self, args: &[String]) -> Result<()> {
        let [gid, template, params @ ..] = args else {
            return Err(RiverError::InvalidInput(format!(
                "mail.send needs gid and template, got {:?}",
                args
            )));
        };
        let template: MailTemplate = template.parse()?;
        let raw = params.join("/");
        let params = if raw.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(&raw)
                .map_err(|e| RiverError::InvalidInput(format!("mail parameters: {}", e)))?
        };

        info!(worker = %self.name, gid = %gid, template = %template, "Email");
        self.notifier
            .notify(gid, template, &template.render_params(&params))
            .await
    }
}

#[async_trait]
impl Handler for MailWorker {
    async fn on_command(&mut self, channel: &str, name: &str, args: &[String]) -> Result<()> {
        if name != command::MAIL_SEND {
            warn!(worker = %self.name, channel, command = name, "Unexpected command");
            return Ok(());
        }
        if let Err(e) = self.send(args).await {
            error!(worker = %self.name, args = ?args, error = %e, "Mail not sent");
        }
        Ok(())
    }

    async fn on_exit(&mut self, _channel: &str, stop: &StopHandle) -> Result<()> {
        warn!(worker = %self.name, "Misc worker is terminating nicely...");
        stop.stop();
        Ok(())
    }
}

pub struct MailWorkerFactory {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    period: Duration,
}

impl WorkerFactory for MailWorkerFactory {
    fn channel(&self, name: &str) -> String {
        keys::mail_channel(name)
    }

    fn spawn(&self, name: String) -> JoinHandle<()> {
        let mut worker = MailWorker::new(&name, Arc::clone(&self.notifier));
        let listener = Listener::new(Bus::new(Arc::clone(&self.store)));
        let period = self.period;
        tokio::spawn(async move {
            let channels = worker.channels();
            if let Err(e) = listener.listen(&channels, &mut worker, period).await {
                error!(worker = %name, error = %e, "Misc worker failed");
            }
        })
    }
}

/// Master loop: owns the workers, handles nothing but exit
struct MiscMaster {
    name: String,
    supervisor: Arc<Supervisor>,
}

#[async_trait]
impl Handler for MiscMaster {
    async fn on_exit(&mut self, _channel: &str, stop: &StopHandle) -> Result<()> {
        warn!(name = %self.name, "Misc service terminating listener...");
        stop.stop();
        self.supervisor.on_terminate().await;
        Ok(())
    }
}

pub struct MiscService {
    ctx: ServiceContext,
    listener: Listener,
    supervisor: Arc<Supervisor>,
}

impl MiscService {
    pub fn new(ctx: ServiceContext, notifier: Arc<dyn Notifier>) -> Self {
        let config = &ctx.config.misc;
        let listener = Listener::new(Bus::new(Arc::clone(&ctx.store)));
        let factory = Arc::new(MailWorkerFactory {
            store: Arc::clone(&ctx.store),
            notifier,
            period: config.period,
        });
        let supervisor = Supervisor::new(&ctx.name, keys::mail_channel(&ctx.name), listener.clone())
            .with_workers(factory, config.workers_min, config.workers_max);
        Self {
            ctx,
            listener,
            supervisor: Arc::new(supervisor),
        }
    }
}

#[async_trait]
impl Service for MiscService {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Misc
    }

    fn supervisor(&self) -> Arc<Supervisor> {
        Arc::clone(&self.supervisor)
    }

    async fn run(&self) -> Result<()> {
        info!(name = %self.ctx.name, "Misc service starting...");
        self.supervisor.start().await?;

        let mut master = MiscMaster {
            name: self.ctx.name.clone(),
            supervisor: Arc::clone(&self.supervisor),
        };
        let channels = vec![keys::mail_channel(&self.ctx.name)];
        let result = self
            .listener
            .listen(&channels, &mut master, self.ctx.config.misc.period)
            .await;
        warn!(name = %self.ctx.name, "Misc service listener exit");
        self.supervisor.abort_remaining().await;
        result
    }
}
