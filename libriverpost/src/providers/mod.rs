//! Collaborator seams: content sources, destination networks and mail
//!
//! The engine never talks HTTP itself. Fetching a source feed, posting to a
//! destination network and sending e-mail all go through the traits below.
//!
//! # Examples
//!
//! ```no_run
//! use libriverpost::providers::{mock::MockPublisher, ProviderPublisher};
//!
//! let twitter = MockPublisher::success("twitter");
//! assert_eq!(twitter.name(), "twitter");
//! ```

use async_trait::async_trait;
use secrecy::SecretString;

use crate::error::Result;
use crate::types::{ActivityDocument, MailTemplate, PreparedItem};

pub mod dry_run;

// Mocks are available for all builds (not just tests) to support integration tests
pub mod mock;

/// Source feed access
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Fetch the latest activity of an account
    ///
    /// `Ok(None)` means the account has nothing to offer (deleted, private).
    /// Transient conditions are reported as `ProviderError::Retry`.
    async fn fetch(&self, gid: &str, max_results: u32) -> Result<Option<ActivityDocument>>;

    /// Resolve a user-supplied account name to a gid
    async fn validate_user(&self, name: &str) -> Result<Option<String>>;
}

/// One destination network
#[async_trait]
pub trait ProviderPublisher: Send + Sync {
    /// Lowercase provider identifier, also the suffix of its bus channel
    fn name(&self) -> &str;

    /// Access token of a destination user, `None` when revoked or missing
    async fn token(&self, user: &str) -> Result<Option<SecretString>>;

    /// Per-user option such as `in_cty` or `time_space_min`
    async fn user_param(&self, _user: &str, _name: &str) -> Result<Option<String>> {
        Ok(None)
    }

    /// Post an item; with `existing_message_id` the post replaces that message
    ///
    /// Returns the provider's message id, or `None` when the provider
    /// declined without an error.
    async fn publish(
        &self,
        user: &str,
        token: &SecretString,
        item: &PreparedItem,
        existing_message_id: Option<&str>,
    ) -> Result<Option<String>>;

    async fn delete(&self, user: &str, message_id: &str, token: &SecretString) -> Result<bool>;

    /// Providers that cannot edit in place delete the old message and post anew
    fn deletes_before_edit(&self) -> bool {
        true
    }

    async fn register_destination(&self, user: &str) -> Result<bool>;

    async fn refresh_avatar(&self, user: &str) -> Result<()>;
}

/// E-mail delivery
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, gid: &str, template: MailTemplate, params: &serde_json::Value) -> Result<()>;
}
