//! Command bus over store lists
//!
//! Channels are store lists. A sender pushes an encoded message onto a
//! channel; a [`Listener`] blocks on several channels at once and dispatches
//! what it pops to a [`Handler`].
//!
//! Wire format: a command is `~M~<name>[/<arg>]*`. The exit sentinel is the
//! literal `~EXIT~`. Anything else is a raw payload, used for completion
//! signals and wake-ups.
//!
//! `send` appends at the tail (FIFO); the `*_now` variants insert at the
//! head so the message overtakes whatever is queued.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::error::{BusError, Result};
use crate::store::Store;

pub const MESSAGE_PREFIX: &str = "~M~";
pub const EXIT_COMMAND: &str = "~EXIT~";
const ARG_SEPARATOR: char = '/';

pub mod command {
    pub const UPDATE: &str = "update";
    pub const VALIDATE: &str = "validate";
    pub const REGISTER: &str = "register";
    pub const PUBLISH: &str = "publish";
    pub const UPDATE_AVATAR: &str = "update_avatar";
    pub const MAIL_SEND: &str = "mail.send";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Command { name: String, args: Vec<String> },
    Exit,
    Raw(String),
}

impl Message {
    pub fn parse(payload: &str) -> Self {
        if payload == EXIT_COMMAND {
            return Message::Exit;
        }
        match payload.strip_prefix(MESSAGE_PREFIX) {
            Some(body) => {
                let mut parts = body.split(ARG_SEPARATOR).map(str::to_string);
                let name = parts.next().unwrap_or_default();
                Message::Command {
                    name,
                    args: parts.collect(),
                }
            }
            None => Message::Raw(payload.to_string()),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Message::Command { name, args } => {
                let mut out = String::from(MESSAGE_PREFIX);
                out.push_str(name);
                for arg in args {
                    out.push(ARG_SEPARATOR);
                    out.push_str(arg);
                }
                out
            }
            Message::Exit => EXIT_COMMAND.to_string(),
            Message::Raw(payload) => payload.clone(),
        }
    }
}

fn encode_command(name: &str, args: &[&str]) -> Result<String> {
    if name.is_empty() || name.contains(ARG_SEPARATOR) {
        return Err(BusError::InvalidCommand(name.to_string()).into());
    }
    Ok(Message::Command {
        name: name.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
    }
    .encode())
}

/// Sending half of the bus
#[derive(Clone)]
pub struct Bus {
    store: Arc<dyn Store>,
}

impl Bus {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Enqueue a command at the tail of `channel`
    pub async fn send(&self, channel: &str, name: &str, args: &[&str]) -> Result<()> {
        let payload = encode_command(name, args)?;
        debug!(channel, payload = %payload, "send");
        self.store.rpush(channel, &payload).await?;
        Ok(())
    }

    /// Enqueue a command at the head of `channel`
    pub async fn send_now(&self, channel: &str, name: &str, args: &[&str]) -> Result<()> {
        let payload = encode_command(name, args)?;
        debug!(channel, payload = %payload, "send now");
        self.store.lpush(channel, &payload).await?;
        Ok(())
    }

    pub async fn send_raw(&self, channel: &str, payload: &str) -> Result<()> {
        self.store.rpush(channel, payload).await?;
        Ok(())
    }

    pub async fn send_raw_now(&self, channel: &str, payload: &str) -> Result<()> {
        self.store.lpush(channel, payload).await?;
        Ok(())
    }

    /// Pending messages on a channel
    pub async fn backlog(&self, channel: &str) -> Result<usize> {
        self.store.llen(channel).await
    }
}

/// Callbacks invoked by [`Listener::listen`]
///
/// Only `on_exit` is required: it decides how the loop ends and must call
/// [`StopHandle::stop`] (directly or through a supervisor) to end it.
#[async_trait]
pub trait Handler: Send {
    async fn on_command(&mut self, channel: &str, name: &str, args: &[String]) -> Result<()> {
        warn!(channel, command = name, args = ?args, "Unhandled command");
        Ok(())
    }

    async fn on_raw(&mut self, channel: &str, payload: &str) -> Result<()> {
        debug!(channel, payload, "Ignoring raw message");
        Ok(())
    }

    async fn on_timeout(&mut self) -> Result<()> {
        Ok(())
    }

    async fn on_exit(&mut self, channel: &str, stop: &StopHandle) -> Result<()>;

    /// Timeout for the next blocking pop
    fn next_timeout(&self, base: Duration) -> Duration {
        base
    }
}

#[derive(Debug, Default)]
struct StopState {
    stopped: AtomicBool,
    active: AtomicBool,
}

/// Shared stop flag of one listener
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    inner: Arc<StopState>,
}

impl StopHandle {
    /// Request termination. Returns true for the call that actually stopped it.
    pub fn stop(&self) -> bool {
        !self.inner.stopped.swap(true, Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// True while `listen` is looping and no stop was requested
    pub fn is_running(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst) && !self.is_stopped()
    }
}

/// Receiving half of the bus
#[derive(Clone)]
pub struct Listener {
    bus: Bus,
    stop: StopHandle,
}

impl Listener {
    pub fn new(bus: Bus) -> Self {
        Self {
            bus,
            stop: StopHandle::default(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Pop from `channels` and dispatch to `handler` until stopped
    ///
    /// Store failures end the loop with an error. Handler failures are
    /// logged and the loop goes on.
    pub async fn listen<H: Handler>(
        &self,
        channels: &[String],
        handler: &mut H,
        timeout: Duration,
    ) -> Result<()> {
        self.stop.inner.active.store(true, Ordering::SeqCst);
        let result = self.run_loop(channels, handler, timeout).await;
        self.stop.inner.active.store(false, Ordering::SeqCst);
        result
    }

    async fn run_loop<H: Handler>(
        &self,
        channels: &[String],
        handler: &mut H,
        timeout: Duration,
    ) -> Result<()> {
        while !self.stop.is_stopped() {
            let wait = handler.next_timeout(timeout);
            let popped = self.bus.store.blpop(channels, wait).await?;

            let outcome = match popped {
                None => handler.on_timeout().await,
                Some((channel, payload)) => match Message::parse(&payload) {
                    Message::Exit => handler.on_exit(&channel, &self.stop).await,
                    Message::Command { name, args } => {
                        handler.on_command(&channel, &name, &args).await
                    }
                    Message::Raw(raw) => handler.on_raw(&channel, &raw).await,
                },
            };

            if let Err(e) = outcome {
                error!(error = %e, "Handler failed, continuing");
            }
        }
        Ok(())
    }

    /// Send the exit sentinel with priority
    ///
    /// When `self_target` is set the channel belongs to this listener; if
    /// the listener is not running the message would never be consumed, so
    /// nothing is sent.
    pub async fn send_exit(&self, channel: &str, self_target: bool) -> Result<()> {
        if self_target && !self.stop.is_running() {
            warn!(channel, "Listener not running, not sending exit to self");
            return Ok(());
        }
        self.bus.send_raw_now(channel, EXIT_COMMAND).await
    }
}
