//! Per-link content filters
//!
//! A link may carry a filter record with:
//! - `keyword`: comma separated terms, a leading `-` marks a term that must
//!   not appear
//! - `strip`: remove the matched positive terms from the posted text
//! - `likes`: minimum number of likes before an item is posted
//! - `tagline`: text appended to every post

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{Result, RiverError, StoreError};
use crate::keys;
use crate::store::Store;
use crate::types::{ContentItem, Link};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub likes: Option<u64>,
    #[serde(default)]
    pub strip: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tagline: Option<String>,
}

impl FilterRecord {
    pub fn is_empty(&self) -> bool {
        self.keyword.is_none() && self.likes.is_none() && !self.strip && self.tagline.is_none()
    }

    /// Fields set in `overlay` replace ours
    pub fn merge(&self, overlay: &FilterRecord) -> FilterRecord {
        FilterRecord {
            keyword: overlay.keyword.clone().or_else(|| self.keyword.clone()),
            likes: overlay.likes.or(self.likes),
            strip: overlay.strip || self.strip,
            tagline: overlay.tagline.clone().or_else(|| self.tagline.clone()),
        }
    }

    pub fn keyword_filter(&self) -> Result<Option<KeywordFilter>> {
        match self.keyword.as_deref() {
            Some(spec) if !spec.trim().is_empty() => KeywordFilter::parse(spec).map(Some),
            _ => Ok(None),
        }
    }

    /// Run every filter on an item; an accepted verdict carries the text to post
    pub fn apply(&self, item: &ContentItem) -> Result<Verdict> {
        if let Some(min) = self.likes {
            if item.likes < min {
                return Ok(Verdict::Rejected(format!(
                    "{} likes, need {}",
                    item.likes, min
                )));
            }
        }

        let base = item.filter_text().unwrap_or_default().to_string();
        let text = match self.keyword_filter()? {
            None => base,
            Some(filter) => {
                let Some(source) = item.filter_text() else {
                    return Ok(Verdict::Rejected("no text to match keywords".to_string()));
                };
                match filter.check(source) {
                    KeywordMatch::Negative(term) => {
                        return Ok(Verdict::Rejected(format!("contains '{}'", term)))
                    }
                    KeywordMatch::Missing => {
                        return Ok(Verdict::Rejected("no keyword matched".to_string()))
                    }
                    KeywordMatch::Accepted if self.strip => filter.strip(source),
                    KeywordMatch::Accepted => base,
                }
            }
        };

        Ok(Verdict::Accepted(self.with_tagline(text)))
    }

    pub fn with_tagline(&self, text: String) -> String {
        match self.tagline.as_deref() {
            Some(tagline) if !tagline.is_empty() => {
                if text.is_empty() {
                    tagline.to_string()
                } else {
                    format!("{} {}", text, tagline)
                }
            }
            _ => text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted(String),
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeywordMatch {
    Accepted,
    /// A negative term was found
    Negative(String),
    /// Positive terms exist and none was found
    Missing,
}

/// Compiled keyword expression
#[derive(Debug, Clone)]
pub struct KeywordFilter {
    any: Regex,
    positive: Option<Regex>,
    negatives: Vec<String>,
}

impl KeywordFilter {
    pub fn parse(spec: &str) -> Result<Self> {
        let mut positives = Vec::new();
        let mut negatives = Vec::new();
        for term in spec.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match term.strip_prefix('-') {
                Some(neg) if !neg.trim().is_empty() => negatives.push(neg.trim().to_string()),
                Some(_) => {}
                None => positives.push(term.to_string()),
            }
        }
        if positives.is_empty() && negatives.is_empty() {
            return Err(RiverError::InvalidInput(format!("empty keyword filter '{}'", spec)));
        }

        let alternation = |terms: &[String]| {
            terms
                .iter()
                .map(|t| regex::escape(t))
                .collect::<Vec<_>>()
                .join("|")
        };
        // Negatives first so they win when terms overlap
        let all: Vec<String> = negatives.iter().chain(positives.iter()).cloned().collect();
        let compile = |pattern: String| {
            Regex::new(&pattern)
                .map_err(|e| RiverError::InvalidInput(format!("keyword filter '{}': {}", spec, e)))
        };

        Ok(Self {
            any: compile(alternation(&all))?,
            positive: if positives.is_empty() {
                None
            } else {
                Some(compile(alternation(&positives))?)
            },
            negatives,
        })
    }

    pub fn check(&self, text: &str) -> KeywordMatch {
        let mut positive_found = false;
        for m in self.any.find_iter(text) {
            if self.negatives.iter().any(|n| n == m.as_str()) {
                return KeywordMatch::Negative(m.as_str().to_string());
            }
            positive_found = true;
        }
        match &self.positive {
            Some(_) if !positive_found => KeywordMatch::Missing,
            _ => KeywordMatch::Accepted,
        }
    }

    /// Remove positive terms and squeeze the whitespace left behind
    pub fn strip(&self, text: &str) -> String {
        match &self.positive {
            Some(positive) => positive
                .replace_all(text, "")
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" "),
            None => text.to_string(),
        }
    }
}

/// Filter records, stored per destination user and keyed by source account
#[derive(Clone)]
pub struct FilterStore {
    store: Arc<dyn Store>,
}

impl FilterStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn get(&self, link: &Link) -> Result<FilterRecord> {
        let raw = self
            .store
            .hget(
                &keys::filters(&link.provider, &link.user),
                &keys::filter_field(&link.gid),
            )
            .await?;
        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw).map_err(StoreError::Serialization)?),
            None => Ok(FilterRecord::default()),
        }
    }

    /// Store a record; an empty record deletes it
    pub async fn set(&self, link: &Link, record: &FilterRecord) -> Result<()> {
        let key = keys::filters(&link.provider, &link.user);
        let field = keys::filter_field(&link.gid);
        if record.is_empty() {
            self.store.hdel(&key, &field).await?;
            return Ok(());
        }
        // Fail early on a bad expression
        record.keyword_filter()?;
        let raw = serde_json::to_string(record).map_err(StoreError::Serialization)?;
        self.store.hset(&key, &field, &raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn item(text: &str, likes: u64) -> ContentItem {
        ContentItem {
            id: "i".to_string(),
            description: Some(text.to_string()),
            likes,
            ..Default::default()
        }
    }

    #[test]
    fn test_keyword_positive_and_negative() {
        let filter = KeywordFilter::parse("rust, tokio, -crypto").unwrap();
        assert_eq!(filter.check("Shipping a rust service"), KeywordMatch::Accepted);
        assert_eq!(filter.check("Nothing relevant here"), KeywordMatch::Missing);
        assert_eq!(
            filter.check("rust and crypto"),
            KeywordMatch::Negative("crypto".to_string())
        );
    }

    #[test]
    fn test_only_negative_terms() {
        let filter = KeywordFilter::parse("-spam").unwrap();
        assert_eq!(filter.check("hello"), KeywordMatch::Accepted);
        assert_eq!(filter.check("buy spam"), KeywordMatch::Negative("spam".to_string()));
    }

    #[test]
    fn test_terms_are_literal() {
        let filter = KeywordFilter::parse("c++").unwrap();
        assert_eq!(filter.check("learning c++ today"), KeywordMatch::Accepted);
        assert_eq!(filter.check("learning c today"), KeywordMatch::Missing);
        assert!(KeywordFilter::parse(" , -").is_err());
    }

    #[test]
    fn test_strip() {
        let filter = KeywordFilter::parse("#xpost").unwrap();
        assert_eq!(filter.strip("New photos #xpost from the trip"), "New photos from the trip");
    }

    #[test]
    fn test_apply_all_filters() {
        let record = FilterRecord {
            keyword: Some("#xpost".to_string()),
            likes: Some(3),
            strip: true,
            tagline: Some("(via riverpost)".to_string()),
        };
        assert_eq!(
            record.apply(&item("hello #xpost", 5)).unwrap(),
            Verdict::Accepted("hello (via riverpost)".to_string())
        );
        assert!(matches!(
            record.apply(&item("hello #xpost", 1)).unwrap(),
            Verdict::Rejected(_)
        ));
        assert!(matches!(
            record.apply(&item("hello", 5)).unwrap(),
            Verdict::Rejected(_)
        ));

        let no_text = ContentItem {
            id: "x".to_string(),
            likes: 10,
            ..Default::default()
        };
        assert!(matches!(record.apply(&no_text).unwrap(), Verdict::Rejected(_)));
    }

    #[test]
    fn test_apply_without_filters_passes_text() {
        let record = FilterRecord::default();
        assert_eq!(
            record.apply(&item("plain", 0)).unwrap(),
            Verdict::Accepted("plain".to_string())
        );
    }

    #[test]
    fn test_merge() {
        let base = FilterRecord {
            keyword: Some("a".to_string()),
            likes: Some(2),
            ..Default::default()
        };
        let overlay = FilterRecord {
            likes: Some(9),
            tagline: Some("t".to_string()),
            ..Default::default()
        };
        let merged = base.merge(&overlay);
        assert_eq!(merged.keyword.as_deref(), Some("a"));
        assert_eq!(merged.likes, Some(9));
        assert_eq!(merged.tagline.as_deref(), Some("t"));
    }

    #[tokio::test]
    async fn test_store_round_trip_and_delete() {
        let filters = FilterStore::new(Arc::new(MemoryStore::new()));
        let link = Link::new("g", "twitter", "u");
        assert_eq!(filters.get(&link).await.unwrap(), FilterRecord::default());

        let record = FilterRecord {
            keyword: Some("rust".to_string()),
            ..Default::default()
        };
        filters.set(&link, &record).await.unwrap();
        assert_eq!(filters.get(&link).await.unwrap(), record);

        filters.set(&link, &FilterRecord::default()).await.unwrap();
        assert_eq!(filters.get(&link).await.unwrap(), FilterRecord::default());
    }
}
