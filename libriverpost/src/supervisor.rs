//! Worker supervision
//!
//! A service runs one master listener and zero or more workers. Workers are
//! tokio tasks with their own bus channel; the supervisor starts them, scales
//! up on backlog and drains them one by one on shutdown: exit sentinel with
//! priority on the worker's channel, then join.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{Listener, EXIT_COMMAND};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Running,
    Terminating,
    Stopped,
}

/// Builds the workers of one service
pub trait WorkerFactory: Send + Sync {
    /// Private channel of the named worker
    fn channel(&self, name: &str) -> String;

    /// Spawn a worker; the task must end once it reads the exit sentinel
    fn spawn(&self, name: String) -> JoinHandle<()>;
}

struct Inner {
    state: SupervisorState,
    workers: Vec<(String, JoinHandle<()>)>,
    started: usize,
}

pub struct Supervisor {
    name: String,
    channel: String,
    listener: Listener,
    factory: Option<Arc<dyn WorkerFactory>>,
    workers_min: usize,
    workers_max: usize,
    join_timeout: Duration,
    inner: Mutex<Inner>,
    stopped: Notify,
}

impl Supervisor {
    /// `listener` and `channel` belong to the master loop of the service
    pub fn new(name: &str, channel: String, listener: Listener) -> Self {
        Self {
            name: name.to_string(),
            channel,
            listener,
            factory: None,
            workers_min: 0,
            workers_max: 0,
            join_timeout: Duration::from_secs(30),
            inner: Mutex::new(Inner {
                state: SupervisorState::Idle,
                workers: Vec::new(),
                started: 0,
            }),
            stopped: Notify::new(),
        }
    }

    pub fn with_workers(mut self, factory: Arc<dyn WorkerFactory>, min: usize, max: usize) -> Self {
        self.factory = Some(factory);
        self.workers_min = min;
        self.workers_max = max.max(min);
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn state(&self) -> SupervisorState {
        self.inner.lock().await.state
    }

    pub async fn worker_count(&self) -> usize {
        self.inner.lock().await.workers.len()
    }

    pub async fn worker_names(&self) -> Vec<String> {
        self.inner
            .lock()
            .await
            .workers
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Move to `Running` and start the minimum number of workers
    pub async fn start(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.state != SupervisorState::Idle {
                warn!(service = %self.name, state = ?inner.state, "Already started");
                return Ok(());
            }
            inner.state = SupervisorState::Running;
        }
        info!(service = %self.name, min = self.workers_min, max = self.workers_max, "Starting");
        for _ in 0..self.workers_min {
            self.start_worker().await;
        }
        Ok(())
    }

    /// Start one worker unless at the maximum; returns its name
    pub async fn start_worker(&self) -> Option<String> {
        let factory = self.factory.as_ref()?;
        let mut inner = self.inner.lock().await;
        if inner.state != SupervisorState::Running {
            debug!(service = %self.name, state = ?inner.state, "Not starting worker");
            return None;
        }
        if inner.workers.len() >= self.workers_max {
            warn!(service = %self.name, workers = inner.workers.len(), "Max workers reached");
            return None;
        }

        let name = format!("{}.{:03}P", self.name, inner.started);
        inner.started += 1;
        info!(service = %self.name, worker = %name, "Starting worker");
        let handle = factory.spawn(name.clone());
        inner.workers.push((name.clone(), handle));
        Some(name)
    }

    /// Start a worker when `backlog` is above `threshold`
    pub async fn scale_up_if(&self, backlog: usize, threshold: usize) -> Option<String> {
        if backlog <= threshold {
            return None;
        }
        warn!(service = %self.name, backlog, threshold, "Backlog above threshold");
        self.start_worker().await
    }

    /// Stop the most recently started worker and wait for it
    ///
    /// Returns false when there was no worker left.
    pub async fn stop_worker(&self) -> Result<bool> {
        let popped = self.inner.lock().await.workers.pop();
        let Some((name, mut handle)) = popped else {
            return Ok(false);
        };
        let Some(factory) = self.factory.as_ref() else {
            handle.abort();
            return Ok(true);
        };

        info!(service = %self.name, worker = %name, "Stopping worker");
        let channel = factory.channel(&name);
        if let Err(e) = self
            .listener
            .bus()
            .send_raw_now(&channel, EXIT_COMMAND)
            .await
        {
            handle.abort();
            return Err(e);
        }

        match tokio::time::timeout(self.join_timeout, &mut handle).await {
            Ok(Ok(())) => debug!(worker = %name, "Worker joined"),
            Ok(Err(e)) => warn!(worker = %name, error = %e, "Worker ended abnormally"),
            Err(_) => {
                warn!(worker = %name, timeout = ?self.join_timeout, "Worker did not exit, aborting");
                handle.abort();
            }
        }
        Ok(true)
    }

    /// Drain every worker, then ask the master loop to exit
    ///
    /// May be called several times (signal, then the exit message it
    /// causes); only the first call does the work.
    pub async fn on_terminate(&self) {
        {
            let mut inner = self.inner.lock().await;
            match inner.state {
                SupervisorState::Terminating | SupervisorState::Stopped => {
                    debug!(service = %self.name, "Termination already in progress");
                    return;
                }
                _ => inner.state = SupervisorState::Terminating,
            }
        }
        warn!(service = %self.name, "Terminating...");

        loop {
            match self.stop_worker().await {
                Ok(true) => info!(service = %self.name, "One worker stopped"),
                Ok(false) => break,
                Err(e) => error!(service = %self.name, error = %e, "Error while stopping worker"),
            }
        }

        if let Err(e) = self.listener.send_exit(&self.channel, true).await {
            error!(service = %self.name, error = %e, "Could not send exit to self");
        }
        self.inner.lock().await.state = SupervisorState::Stopped;
        self.stopped.notify_waiters();
        warn!(service = %self.name, "Terminate sequence complete");
    }

    /// Abort whatever is still running once the master loop has ended
    ///
    /// A terminate sequence still draining workers is waited for first.
    pub async fn abort_remaining(&self) {
        loop {
            let stopped = self.stopped.notified();
            if self.state().await != SupervisorState::Terminating {
                break;
            }
            debug!(service = %self.name, "Waiting for the drain to finish");
            stopped.await;
        }
        let mut inner = self.inner.lock().await;
        for (name, handle) in inner.workers.drain(..) {
            warn!(worker = %name, "Terminating remaining worker");
            handle.abort();
        }
        inner.state = SupervisorState::Stopped;
    }
}
