//! river-svc - riverpost service process
//!
//! Runs one service (poller, publisher, queue or misc) until it is told to
//! stop, either by a signal or by an exit message on its channel.

use clap::Parser;
use libriverpost::error::ProviderError;
use libriverpost::logging::{LogFormat, LoggingConfig};
use libriverpost::service::{self, Collaborators, Service, ServiceContext, ServiceKind};
use libriverpost::{Config, Result, RiverError};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "river-svc")]
#[command(version)]
#[command(about = "Run a riverpost service: poller, publisher, queue or misc")]
#[command(long_about = "\
river-svc - riverpost service process

DESCRIPTION:
    river-svc runs one riverpost service. Services share a store and talk
    to each other over channels kept in it:

    poller     schedules source accounts and polls them with a worker pool
    publisher  republishes new activity to the configured providers
    queue      re-injects postings held back by quiet hours or spacing
    misc       sends notification mails

    Several processes of the same service may run side by side as long as
    each has its own --name.

USAGE:
    # Poller with two dry-run providers
    river-svc --service poller --dummy --provider twitter,tumblr

    # Publisher for one provider, JSON logs to a file
    river-svc --service publisher --name twitter-1 --provider twitter \\
        --dummy --log-format json --log-path /var/log/riverpost

SIGNALS:
    SIGTERM, SIGINT, SIGQUIT - Graceful shutdown (workers are drained first)

CONFIGURATION:
    Configuration file: ~/.config/riverpost/riverpost.toml
    Store location: ~/.local/share/riverpost/river.db

    [poller]
    period = \"2s\"           # master loop timeout
    workers_min = 3
    workers_max = 4

    [publisher]
    max_error_count = 7     # unlink after this many failures
    min_time_space_min = 5  # minutes between two posts to one destination

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error (store, provider)
    2 - Configuration error
    3 - Invalid input (unknown service, bad arguments)
")]
struct Cli {
    /// Service to run
    #[arg(long, value_name = "KIND")]
    #[arg(help = "Service to run: poller, publisher, queue or misc")]
    service: String,

    /// Instance name (defaults to the service kind)
    #[arg(long)]
    name: Option<String>,

    /// Store file (overrides config)
    #[arg(long, value_name = "PATH")]
    store: Option<String>,

    /// Directory holding riverpost.toml
    #[arg(long, value_name = "DIR")]
    config_path: Option<String>,

    /// Providers handled by this process, comma separated
    #[arg(long, value_delimiter = ',')]
    provider: Vec<String>,

    /// Use the store-backed dry-run collaborators
    #[arg(long)]
    dummy: bool,

    /// Directory for a daily rolling log file
    #[arg(long, value_name = "DIR")]
    log_path: Option<String>,

    /// Console log format
    #[arg(long, default_value = "text")]
    #[arg(help = "Log format: text, json or pretty")]
    log_format: LogFormat,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!(error = %e, "river-svc failed");
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let kind: ServiceKind = cli.service.parse()?;
    let name = cli.name.clone().unwrap_or_else(|| kind.to_string());

    let mut logging = LoggingConfig::new(cli.log_format, "info".to_string(), cli.verbose);
    if let Some(dir) = &cli.log_path {
        logging = logging.with_file(dir, &name);
    }
    let _guard = logging.init()?;

    let mut config = match &cli.config_path {
        Some(dir) => Config::load_from_dir(dir)?,
        None => Config::load()?,
    };
    if let Some(store) = cli.store {
        config.store.path = store;
    }

    if !cli.dummy && kind != ServiceKind::Queue {
        return Err(ProviderError::NotConfigured(format!(
            "{} needs network collaborators; only --dummy is available in this build",
            kind
        ))
        .into());
    }

    let ctx = ServiceContext::from_config(&name, config).await?;
    let collab = Collaborators::dry_run(&ctx, &cli.provider);
    let svc: Arc<dyn Service> = Arc::from(service::build(kind, ctx, collab)?);

    info!(service = %kind, name = %name, providers = ?cli.provider, "river-svc starting");
    let signals = tokio::spawn(forward_signals(Arc::clone(&svc)));

    let result = svc.run().await;
    signals.abort();

    match &result {
        Ok(()) => info!(service = %kind, name = %name, "river-svc stopped"),
        Err(e) => error!(service = %kind, name = %name, error = %e, "Service loop failed"),
    }
    result
}

/// Turn every shutdown signal into a supervisor terminate
#[cfg(unix)]
async fn forward_signals(svc: Arc<dyn Service>) -> Result<()> {
    use futures::stream::StreamExt;
    use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
    use signal_hook_tokio::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGQUIT])
        .map_err(|e| RiverError::InvalidInput(format!("Signal setup failed: {}", e)))?;

    while let Some(signal) = signals.next().await {
        warn!(signal, "Received shutdown signal, stopping gracefully...");
        svc.supervisor().on_terminate().await;
    }
    Ok(())
}

#[cfg(not(unix))]
async fn forward_signals(svc: Arc<dyn Service>) -> Result<()> {
    loop {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| RiverError::InvalidInput(format!("Signal setup failed: {}", e)))?;
        warn!("Received Ctrl-C, stopping gracefully...");
        svc.supervisor().on_terminate().await;
    }
}
