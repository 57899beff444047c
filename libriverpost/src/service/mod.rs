//! Service layer for riverpost
//!
//! Each `river-svc` process runs one service kind. Every service has a
//! master loop listening on its own channel and a [`Supervisor`] that owns
//! its workers and drives shutdown.
//!
//! - `poller`: the poll scheduler master plus poll workers
//! - `publisher`: one pipeline per configured provider, no workers
//! - `queue`: the buffer sweeper
//! - `misc`: mail workers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use libriverpost::service::{self, Collaborators, ServiceContext, ServiceKind};
//! use libriverpost::Config;
//!
//! # async fn example() -> libriverpost::Result<()> {
//! let ctx = ServiceContext::from_config("poller", Config::load()?).await?;
//! let collab = Collaborators::dry_run(&ctx, &["twitter".to_string()]);
//! let svc = service::build(ServiceKind::Poller, ctx, collab)?;
//! svc.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod misc;
pub mod poll_worker;
pub mod poller;
pub mod publisher;
pub mod queue;

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{Result, RiverError};
use crate::providers::dry_run::{DryRunPublisher, InboxFetcher, LogNotifier};
use crate::providers::{ContentFetcher, Notifier, ProviderPublisher};
use crate::store::{SqliteStore, Store};
use crate::supervisor::Supervisor;

pub use self::misc::MiscService;
pub use self::poller::{PollScheduler, PollerService, ThroughputStats};
pub use self::poll_worker::PollWorker;
pub use self::publisher::PublisherService;
pub use self::queue::{QueueService, QueueSweeper};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Poller,
    Publisher,
    Queue,
    Misc,
}

impl FromStr for ServiceKind {
    type Err = RiverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "poller" => Ok(ServiceKind::Poller),
            "publisher" => Ok(ServiceKind::Publisher),
            "queue" => Ok(ServiceKind::Queue),
            "misc" => Ok(ServiceKind::Misc),
            other => Err(RiverError::InvalidInput(format!(
                "unknown service '{}', expected poller, publisher, queue or misc",
                other
            ))),
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceKind::Poller => "poller",
            ServiceKind::Publisher => "publisher",
            ServiceKind::Queue => "queue",
            ServiceKind::Misc => "misc",
        };
        f.write_str(name)
    }
}

/// What every service needs: its instance name, the store and the configuration
#[derive(Clone)]
pub struct ServiceContext {
    pub name: String,
    pub store: Arc<dyn Store>,
    pub config: Arc<Config>,
}

impl ServiceContext {
    pub fn new(name: &str, store: Arc<dyn Store>, config: Config) -> Self {
        Self {
            name: name.to_string(),
            store,
            config: Arc::new(config),
        }
    }

    /// Open the SQLite store named in the configuration
    pub async fn from_config(name: &str, config: Config) -> Result<Self> {
        let path = config.store_path();
        let store = SqliteStore::new(&path.to_string_lossy()).await?;
        Ok(Self::new(name, Arc::new(store), config))
    }
}

/// External collaborators handed to the services
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn ContentFetcher>,
    pub publishers: Vec<Arc<dyn ProviderPublisher>>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    /// Store-backed stand-ins that never leave the machine
    pub fn dry_run(ctx: &ServiceContext, providers: &[String]) -> Self {
        Self {
            fetcher: Arc::new(InboxFetcher::new(Arc::clone(&ctx.store))),
            publishers: providers
                .iter()
                .map(|p| {
                    Arc::new(DryRunPublisher::new(p, Arc::clone(&ctx.store))) as Arc<dyn ProviderPublisher>
                })
                .collect(),
            notifier: Arc::new(LogNotifier),
        }
    }
}

#[async_trait]
pub trait Service: Send + Sync {
    fn kind(&self) -> ServiceKind;

    /// Supervisor driving shutdown; signal handlers call `on_terminate` on it
    fn supervisor(&self) -> Arc<Supervisor>;

    /// Run the master loop until it is told to exit
    async fn run(&self) -> Result<()>;
}

pub fn build(kind: ServiceKind, ctx: ServiceContext, collab: Collaborators) -> Result<Box<dyn Service>> {
    Ok(match kind {
        ServiceKind::Poller => Box::new(PollerService::new(ctx, collab.fetcher)),
        ServiceKind::Publisher => {
            if collab.publishers.is_empty() {
                return Err(RiverError::InvalidInput(
                    "publisher service needs at least one provider".to_string(),
                ));
            }
            Box::new(PublisherService::new(ctx, collab.publishers))
        }
        ServiceKind::Queue => Box::new(QueueService::new(ctx)),
        ServiceKind::Misc => Box::new(MiscService::new(ctx, collab.notifier)),
    })
}

/// Current epoch in seconds
pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
