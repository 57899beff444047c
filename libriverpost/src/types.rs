//! Core data types shared across riverpost

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, RiverError};

/// Binding of one source account to one destination user on a provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Link {
    pub gid: String,
    pub provider: String,
    pub user: String,
}

impl Link {
    pub fn new(gid: impl Into<String>, provider: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            gid: gid.into(),
            provider: provider.into(),
            user: user.into(),
        }
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.gid, self.provider, self.user)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    #[default]
    Post,
    Share,
    Photo,
    Album,
    Video,
    Link,
}

/// One activity of a source account's feed
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    /// Epoch seconds of the last change
    pub updated: i64,
    /// Epoch seconds of first publication
    pub published: i64,
    #[serde(default)]
    pub kind: ItemKind,
    #[serde(default)]
    pub description: Option<String>,
    /// Text the user added when sharing
    #[serde(default)]
    pub annotation: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub likes: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Posted to a community rather than the public stream
    #[serde(default)]
    pub community: bool,
}

impl ContentItem {
    /// Items tagged `now` bypass the quiet-hours schedule
    pub fn is_urgent(&self) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case("now"))
    }

    /// Text the keyword filter looks at
    pub fn filter_text(&self) -> Option<&str> {
        self.annotation.as_deref().or(self.description.as_deref())
    }
}

/// Snapshot of a source account's feed as returned by a fetch
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ActivityDocument {
    pub etag: String,
    pub updated: i64,
    pub items: Vec<ContentItem>,
}

/// An item chosen for delivery with its final text
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedItem {
    pub item: ContentItem,
    pub text: String,
}

/// Notification templates understood by the mail service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MailTemplate {
    AccountCreated,
    AccountUnlinked,
    PublisherError,
}

impl MailTemplate {
    pub fn name(&self) -> &'static str {
        match self {
            MailTemplate::AccountCreated => "account_created",
            MailTemplate::AccountUnlinked => "account_unlinked",
            MailTemplate::PublisherError => "publisher_error",
        }
    }

    pub fn subject(&self) -> &'static str {
        match self {
            MailTemplate::AccountCreated => "Welcome to riverpost",
            MailTemplate::AccountUnlinked => "A destination account was unlinked",
            MailTemplate::PublisherError => "Problem publishing to a destination",
        }
    }

    /// Whether the recipient must have accepted e-mail from us first
    pub fn check_accept(&self) -> bool {
        !matches!(self, MailTemplate::AccountCreated)
    }

    /// Template defaults with `params` layered on top
    pub fn render_params(&self, params: &serde_json::Value) -> serde_json::Value {
        let mut merged = serde_json::json!({
            "template": self.name(),
            "subject": self.subject(),
            "check_accept": self.check_accept(),
        });
        if let (Some(target), Some(extra)) = (merged.as_object_mut(), params.as_object()) {
            for (k, v) in extra {
                target.insert(k.clone(), v.clone());
            }
        }
        merged
    }
}

impl FromStr for MailTemplate {
    type Err = RiverError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "account_created" => Ok(MailTemplate::AccountCreated),
            "account_unlinked" => Ok(MailTemplate::AccountUnlinked),
            "publisher_error" => Ok(MailTemplate::PublisherError),
            other => Err(RiverError::InvalidInput(format!("unknown mail template '{}'", other))),
        }
    }
}

impl fmt::Display for MailTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_display() {
        assert_eq!(Link::new("42", "tumblr", "blog").to_string(), "42:tumblr:blog");
    }

    #[test]
    fn test_urgent_tag() {
        let mut item = ContentItem {
            id: "a".to_string(),
            ..Default::default()
        };
        assert!(!item.is_urgent());
        item.tags.push("NOW".to_string());
        assert!(item.is_urgent());
    }

    #[test]
    fn test_filter_text_prefers_annotation() {
        let item = ContentItem {
            id: "a".to_string(),
            description: Some("shared article".to_string()),
            annotation: Some("my take".to_string()),
            ..Default::default()
        };
        assert_eq!(item.filter_text(), Some("my take"));
    }

    #[test]
    fn test_item_deserializes_with_defaults() {
        let item: ContentItem =
            serde_json::from_str(r#"{"id":"x","updated":10,"published":5}"#).unwrap();
        assert_eq!(item.kind, ItemKind::Post);
        assert_eq!(item.likes, 0);
        assert!(!item.community);
    }

    #[test]
    fn test_mail_template_params() {
        let template: MailTemplate = "publisher_error".parse().unwrap();
        assert_eq!(template, MailTemplate::PublisherError);
        let merged = template.render_params(&serde_json::json!({"provider": "twitter"}));
        assert_eq!(merged["provider"], "twitter");
        assert_eq!(merged["check_accept"], true);
        assert!(!MailTemplate::AccountCreated.check_accept());
        assert!("bogus".parse::<MailTemplate>().is_err());
    }
}
