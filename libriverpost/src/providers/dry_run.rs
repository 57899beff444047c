//! Store-backed collaborators for running the services without network access
//!
//! `--dummy` wires these in: the publisher logs what it would post and hands
//! back synthetic message ids, the fetcher serves documents that something
//! else dropped into the store, and the notifier only logs.

use async_trait::async_trait;
use secrecy::SecretString;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

use super::{ContentFetcher, Notifier, ProviderPublisher};
use crate::error::{Result, StoreError};
use crate::links::LinkStore;
use crate::store::Store;
use crate::types::{ActivityDocument, MailTemplate, PreparedItem};

/// Hash of ingested documents, one field per gid
pub const INBOX_DOCUMENTS: &str = "inbox:documents";
/// Hash of known account names, name -> gid
pub const INBOX_USERS: &str = "inbox:users";

pub struct DryRunPublisher {
    name: String,
    links: LinkStore,
    counter: AtomicU64,
}

impl DryRunPublisher {
    pub fn new(name: &str, store: Arc<dyn Store>) -> Self {
        Self {
            name: name.to_string(),
            links: LinkStore::new(store),
            counter: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl ProviderPublisher for DryRunPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn token(&self, user: &str) -> Result<Option<SecretString>> {
        Ok(Some(SecretString::from(format!("dry-run:{}", user))))
    }

    async fn user_param(&self, user: &str, name: &str) -> Result<Option<String>> {
        self.links.user_param(&self.name, user, name).await
    }

    async fn publish(
        &self,
        user: &str,
        _token: &SecretString,
        item: &PreparedItem,
        existing_message_id: Option<&str>,
    ) -> Result<Option<String>> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let message_id = format!("dry-{}-{}", self.name, n);
        info!(
            provider = %self.name,
            user,
            item = %item.item.id,
            replaces = ?existing_message_id,
            message_id = %message_id,
            text = %item.text,
            "Would publish"
        );
        Ok(Some(message_id))
    }

    async fn delete(&self, user: &str, message_id: &str, _token: &SecretString) -> Result<bool> {
        info!(provider = %self.name, user, message_id, "Would delete");
        Ok(true)
    }

    async fn register_destination(&self, user: &str) -> Result<bool> {
        info!(provider = %self.name, user, "Would register destination");
        Ok(true)
    }

    async fn refresh_avatar(&self, user: &str) -> Result<()> {
        info!(provider = %self.name, user, "Would refresh avatar");
        Ok(())
    }
}

/// Fetcher that reads documents pushed into [`INBOX_DOCUMENTS`]
pub struct InboxFetcher {
    store: Arc<dyn Store>,
}

impl InboxFetcher {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Drop a document into the inbox
    pub async fn ingest(&self, gid: &str, doc: &ActivityDocument) -> Result<()> {
        let raw = serde_json::to_string(doc).map_err(StoreError::Serialization)?;
        self.store.hset(INBOX_DOCUMENTS, gid, &raw).await
    }
}

#[async_trait]
impl ContentFetcher for InboxFetcher {
    async fn fetch(&self, gid: &str, max_results: u32) -> Result<Option<ActivityDocument>> {
        let Some(raw) = self.store.hget(INBOX_DOCUMENTS, gid).await? else {
            return Ok(None);
        };
        let mut doc: ActivityDocument =
            serde_json::from_str(&raw).map_err(StoreError::Serialization)?;
        // Newest first, like a real feed page
        doc.items.sort_by(|a, b| b.updated.cmp(&a.updated));
        doc.items.truncate(max_results as usize);
        Ok(Some(doc))
    }

    async fn validate_user(&self, name: &str) -> Result<Option<String>> {
        self.store.hget(INBOX_USERS, name).await
    }
}

/// Notifier that writes to the log only
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, gid: &str, template: MailTemplate, params: &serde_json::Value) -> Result<()> {
        let rendered = template.render_params(params);
        info!(gid, template = %template, params = %rendered, "Would send mail");
        Ok(())
    }
}
