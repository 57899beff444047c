//! riverpost - cross-posting engine
//!
//! This library polls source accounts at an adaptive cadence and republishes
//! their activity to destination networks, holding posts during quiet hours,
//! spacing them out per destination and backing off from destinations that
//! keep failing. Services talk to each other over a command bus built on a
//! shared store.

pub mod balancer;
pub mod buffer;
pub mod bus;
pub mod cache;
pub mod config;
pub mod error;
pub mod filter;
pub mod keys;
pub mod links;
pub mod logging;
pub mod message_map;
pub mod pipeline;
pub mod providers;
pub mod schedule;
pub mod service;
pub mod settings;
pub mod store;
pub mod supervisor;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use error::{Result, RiverError};
pub use store::{MemoryStore, SqliteStore, Store};
pub use types::{ActivityDocument, ContentItem, Link, MailTemplate};
