//! Store key and channel names shared by every service

use crate::types::Link;

pub const POLLER_ALL: &str = "poller:all";
/// Completion channel: poll workers push a bare gid here when a poll finished
pub const POLLER_ALL_OUT: &str = "poller:all-out";
pub const PUBLISHER_ALL: &str = "publisher:all";
pub const QUEUE_ALL: &str = "queue:all";
pub const MAIL_ALL: &str = "mail:all";

pub const DUE_SET: &str = "poller:all:gid.set";
pub const REGISTER_SET: &str = "poller:all:register.set";
pub const POLLER_SET: &str = "poller:all:poller.set";

pub const BUFFER_SET: &str = "buffer.buffer";
pub const SCHEDULE_STORE: &str = "buffer.store";

/// Raw payload that asks a master to run a round right away
pub const WAKE_PAYLOAD: &str = "#";

pub fn poller_channel(name: &str) -> String {
    format!("poller:{}", name)
}

/// Shared channel of one provider, popped by every publisher serving it
pub fn publisher_channel(provider: &str) -> String {
    format!("publisher:{}", provider)
}

/// Private channel of one publisher process; never collides with a provider
pub fn publisher_instance_channel(name: &str) -> String {
    format!("publisher:@{}", name)
}

pub fn queue_channel(name: &str) -> String {
    format!("queue:{}", name)
}

pub fn mail_channel(name: &str) -> String {
    format!("mail:{}", name)
}

pub fn worker_stats(name: &str) -> String {
    format!("poller.info:{}", name)
}

pub fn cache(gid: &str) -> String {
    format!("cache:{}", gid)
}

pub fn minute_field(minute: u32) -> String {
    format!("m:{}", minute)
}

pub fn destinations(gid: &str) -> String {
    format!("gid:{}:destinations", gid)
}

pub fn bound_users(gid: &str, provider: &str) -> String {
    format!("gid:{}:bind:{}", gid, provider)
}

pub fn sources(provider: &str, user: &str) -> String {
    format!("bind:{}:{}:sources", provider, user)
}

pub fn link(link: &Link) -> String {
    format!("link:{}:{}:{}", link.gid, link.provider, link.user)
}

pub fn destination(provider: &str, user: &str) -> String {
    format!("dest:{}:{}", provider, user)
}

pub fn filters(provider: &str, user: &str) -> String {
    format!("{}:{}", provider, user)
}

pub fn filter_field(gid: &str) -> String {
    format!("filter:{}", gid)
}

pub fn message_map(provider: &str, user: &str) -> String {
    format!("{}:{}:message", provider, user)
}

pub fn activity_log(gid: &str) -> String {
    format!("log:{}", gid)
}

/// Member of the buffer sorted set
pub fn buffer_member(gid: &str, provider: &str) -> String {
    format!("{}:{}", gid, provider)
}

/// Field of the schedule hash
pub fn schedule_field(gid: &str, provider: &str, user: &str) -> String {
    format!("{}:{}:{}", gid, provider, user)
}
