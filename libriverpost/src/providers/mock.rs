//! Mock collaborators for testing
//!
//! Configurable fakes for every collaborator seam. Each records its calls
//! behind `Arc<Mutex<_>>` so tests can share one instance with the engine
//! and inspect it afterwards.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{ContentFetcher, Notifier, ProviderPublisher};
use crate::error::{ProviderError, Result};
use crate::types::{ActivityDocument, MailTemplate, PreparedItem};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A call to [`MockPublisher::publish`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPost {
    pub user: String,
    pub item_id: String,
    pub text: String,
    pub existing_message_id: Option<String>,
    pub message_id: Option<String>,
}

/// Configurable destination network
pub struct MockPublisher {
    name: String,
    succeeds: AtomicBool,
    deletes_before_edit: bool,
    token: Mutex<Option<String>>,
    params: Mutex<HashMap<String, String>>,
    next_id: AtomicUsize,
    published: Arc<Mutex<Vec<PublishedPost>>>,
    deleted: Arc<Mutex<Vec<String>>>,
    registered: Arc<Mutex<Vec<String>>>,
    avatars: Arc<Mutex<Vec<String>>>,
}

impl MockPublisher {
    /// A publisher that accepts everything with token `"<name>-token"`
    pub fn success(name: &str) -> Self {
        Self {
            name: name.to_string(),
            succeeds: AtomicBool::new(true),
            deletes_before_edit: true,
            token: Mutex::new(Some(format!("{}-token", name))),
            params: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
            published: Arc::new(Mutex::new(Vec::new())),
            deleted: Arc::new(Mutex::new(Vec::new())),
            registered: Arc::new(Mutex::new(Vec::new())),
            avatars: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A publisher whose posts all fail
    pub fn failing(name: &str) -> Self {
        let publisher = Self::success(name);
        publisher.set_succeeds(false);
        publisher
    }

    /// A publisher that can edit in place
    pub fn editing(name: &str) -> Self {
        Self {
            deletes_before_edit: false,
            ..Self::success(name)
        }
    }

    pub fn set_succeeds(&self, succeeds: bool) {
        self.succeeds.store(succeeds, Ordering::SeqCst);
    }

    pub fn set_token(&self, token: Option<&str>) {
        *lock(&self.token) = token.map(str::to_string);
    }

    /// Same value for every user
    pub fn set_param(&self, name: &str, value: &str) {
        lock(&self.params).insert(name.to_string(), value.to_string());
    }

    pub fn published(&self) -> Vec<PublishedPost> {
        lock(&self.published).clone()
    }

    /// Successful posts only
    pub fn delivered(&self) -> Vec<PublishedPost> {
        self.published()
            .into_iter()
            .filter(|p| p.message_id.is_some())
            .collect()
    }

    pub fn publish_call_count(&self) -> usize {
        lock(&self.published).len()
    }

    pub fn deleted(&self) -> Vec<String> {
        lock(&self.deleted).clone()
    }

    pub fn registered(&self) -> Vec<String> {
        lock(&self.registered).clone()
    }

    pub fn avatar_refreshes(&self) -> Vec<String> {
        lock(&self.avatars).clone()
    }
}

#[async_trait]
impl ProviderPublisher for MockPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn token(&self, _user: &str) -> Result<Option<SecretString>> {
        Ok(lock(&self.token).clone().map(SecretString::from))
    }

    async fn user_param(&self, _user: &str, name: &str) -> Result<Option<String>> {
        Ok(lock(&self.params).get(name).cloned())
    }

    async fn publish(
        &self,
        user: &str,
        _token: &SecretString,
        item: &PreparedItem,
        existing_message_id: Option<&str>,
    ) -> Result<Option<String>> {
        let message_id = if self.succeeds.load(Ordering::SeqCst) {
            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            Some(format!("{}:msg-{}", self.name, n))
        } else {
            None
        };

        lock(&self.published).push(PublishedPost {
            user: user.to_string(),
            item_id: item.item.id.clone(),
            text: item.text.clone(),
            existing_message_id: existing_message_id.map(str::to_string),
            message_id: message_id.clone(),
        });

        match message_id {
            Some(id) => Ok(Some(id)),
            None => Err(ProviderError::Posting(format!("{} rejected the post", self.name)).into()),
        }
    }

    async fn delete(&self, _user: &str, message_id: &str, token: &SecretString) -> Result<bool> {
        if token.expose_secret().is_empty() {
            return Err(ProviderError::Authentication("empty token".to_string()).into());
        }
        lock(&self.deleted).push(message_id.to_string());
        Ok(true)
    }

    fn deletes_before_edit(&self) -> bool {
        self.deletes_before_edit
    }

    async fn register_destination(&self, user: &str) -> Result<bool> {
        lock(&self.registered).push(user.to_string());
        Ok(true)
    }

    async fn refresh_avatar(&self, user: &str) -> Result<()> {
        lock(&self.avatars).push(user.to_string());
        Ok(())
    }
}

/// Source feed served from memory
#[derive(Default)]
pub struct MockFetcher {
    documents: Mutex<HashMap<String, ActivityDocument>>,
    unavailable: Mutex<HashSet<String>>,
    users: Mutex<HashMap<String, String>>,
    fetch_calls: Arc<Mutex<Vec<String>>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_document(&self, gid: &str, doc: ActivityDocument) {
        lock(&self.documents).insert(gid.to_string(), doc);
    }

    /// Make fetches of `gid` fail with a retryable error
    pub fn set_unavailable(&self, gid: &str, unavailable: bool) {
        let mut set = lock(&self.unavailable);
        if unavailable {
            set.insert(gid.to_string());
        } else {
            set.remove(gid);
        }
    }

    pub fn add_user(&self, name: &str, gid: &str) {
        lock(&self.users).insert(name.to_string(), gid.to_string());
    }

    pub fn fetch_calls(&self) -> Vec<String> {
        lock(&self.fetch_calls).clone()
    }
}

#[async_trait]
impl ContentFetcher for MockFetcher {
    async fn fetch(&self, gid: &str, _max_results: u32) -> Result<Option<ActivityDocument>> {
        lock(&self.fetch_calls).push(gid.to_string());
        if lock(&self.unavailable).contains(gid) {
            return Err(ProviderError::Retry(format!("{} temporarily unavailable", gid)).into());
        }
        Ok(lock(&self.documents).get(gid).cloned())
    }

    async fn validate_user(&self, name: &str) -> Result<Option<String>> {
        Ok(lock(&self.users).get(name).cloned())
    }
}

/// A notification captured by [`RecordingNotifier`]
#[derive(Debug, Clone, PartialEq)]
pub struct SentMail {
    pub gid: String,
    pub template: MailTemplate,
    pub params: serde_json::Value,
}

/// Notifier that only records what it was asked to send
#[derive(Default, Clone)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<SentMail>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentMail> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, gid: &str, template: MailTemplate, params: &serde_json::Value) -> Result<()> {
        lock(&self.sent).push(SentMail {
            gid: gid.to_string(),
            template,
            params: params.clone(),
        });
        Ok(())
    }
}
