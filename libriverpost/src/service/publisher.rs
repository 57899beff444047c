//! Publisher service
//!
//! One [`Pipeline`] per configured provider. Listens on `publisher:all`, its
//! own channel and every provider channel; commands are routed by the
//! channel they arrived on.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::{now, Service, ServiceContext, ServiceKind};
use crate::bus::{command, Bus, Handler, Listener, StopHandle};
use crate::error::Result;
use crate::keys;
use crate::pipeline::{LinkOutcome, Pipeline, PipelineConfig};
use crate::providers::ProviderPublisher;
use crate::supervisor::Supervisor;
use crate::types::Link;

pub struct PublisherHandler {
    name: String,
    pipelines: BTreeMap<String, Pipeline>,
    supervisor: Arc<Supervisor>,
}

impl PublisherHandler {
    pub fn new(ctx: &ServiceContext, providers: &[Arc<dyn ProviderPublisher>], supervisor: Arc<Supervisor>) -> Self {
        let config = PipelineConfig::from(&ctx.config.publisher);
        let pipelines = providers
            .iter()
            .map(|p| {
                (
                    keys::publisher_channel(p.name()),
                    Pipeline::new(Arc::clone(&ctx.store), Arc::clone(p), config),
                )
            })
            .collect();
        Self {
            name: ctx.name.clone(),
            pipelines,
            supervisor,
        }
    }

    /// Own channel, the shared channel and one per provider, without duplicates
    pub fn channels(&self) -> Vec<String> {
        let mut channels = vec![
            keys::PUBLISHER_ALL.to_string(),
            keys::publisher_instance_channel(&self.name),
        ];
        for channel in self.pipelines.keys() {
            if !channels.contains(channel) {
                channels.push(channel.clone());
            }
        }
        channels
    }

    fn pipeline(&self, channel: &str) -> Option<&Pipeline> {
        let pipeline = self.pipelines.get(channel);
        if pipeline.is_none() {
            error!(publisher = %self.name, channel, "Provider not configured");
        }
        pipeline
    }

    pub async fn publish(&self, channel: &str, gid: &str, now: i64) -> Result<Vec<(Link, LinkOutcome)>> {
        if gid.is_empty() {
            warn!(publisher = %self.name, "Not publishing, gid is empty");
            return Ok(Vec::new());
        }
        let Some(pipeline) = self.pipeline(channel) else {
            return Ok(Vec::new());
        };
        info!(publisher = %self.name, gid, provider = pipeline.provider().name(), "Publishing updates");
        pipeline.publish(gid, now).await
    }

    pub async fn register(&self, channel: &str, user: &str) -> Result<bool> {
        let Some(pipeline) = self.pipeline(channel) else {
            return Ok(false);
        };
        let provider = pipeline.provider();
        info!(provider = provider.name(), user, "Registering destination");
        let registered = provider.register_destination(user).await?;
        if !registered {
            warn!(provider = provider.name(), user, "Destination registration failed");
        }
        Ok(registered)
    }

    pub async fn update_avatar(&self, channel: &str, user: &str) -> Result<()> {
        let Some(pipeline) = self.pipeline(channel) else {
            return Ok(());
        };
        info!(provider = pipeline.provider().name(), user, "Avatar refresh");
        pipeline.provider().refresh_avatar(user).await
    }
}

#[async_trait]
impl Handler for PublisherHandler {
    async fn on_command(&mut self, channel: &str, name: &str, args: &[String]) -> Result<()> {
        let arg = args.first().map(String::as_str).unwrap_or_default();
        match name {
            command::PUBLISH => self.publish(channel, arg, now()).await.map(|_| ()),
            command::REGISTER => self.register(channel, arg).await.map(|_| ()),
            command::UPDATE_AVATAR => self.update_avatar(channel, arg).await,
            _ => {
                warn!(publisher = %self.name, channel, command = name, "Unexpected command");
                Ok(())
            }
        }
    }

    async fn on_exit(&mut self, _channel: &str, stop: &StopHandle) -> Result<()> {
        warn!(publisher = %self.name, "Publisher terminating on exit message");
        stop.stop();
        self.supervisor.on_terminate().await;
        Ok(())
    }
}

pub struct PublisherService {
    ctx: ServiceContext,
    providers: Vec<Arc<dyn ProviderPublisher>>,
    listener: Listener,
    supervisor: Arc<Supervisor>,
}

impl PublisherService {
    pub fn new(ctx: ServiceContext, providers: Vec<Arc<dyn ProviderPublisher>>) -> Self {
        let listener = Listener::new(Bus::new(Arc::clone(&ctx.store)));
        let supervisor = Supervisor::new(&ctx.name, keys::publisher_instance_channel(&ctx.name), listener.clone());
        Self {
            ctx,
            providers,
            listener,
            supervisor: Arc::new(supervisor),
        }
    }
}

#[async_trait]
impl Service for PublisherService {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Publisher
    }

    fn supervisor(&self) -> Arc<Supervisor> {
        Arc::clone(&self.supervisor)
    }

    async fn run(&self) -> Result<()> {
        let names: Vec<&str> = self.providers.iter().map(|p| p.name()).collect();
        info!(name = %self.ctx.name, providers = ?names, "Publisher starting...");
        self.supervisor.start().await?;

        let mut handler = PublisherHandler::new(&self.ctx, &self.providers, Arc::clone(&self.supervisor));
        let channels = handler.channels();
        let result = self
            .listener
            .listen(&channels, &mut handler, self.ctx.config.publisher.period)
            .await;
        warn!(name = %self.ctx.name, "Publisher listener exit");
        result
    }
}
