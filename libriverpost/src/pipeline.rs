//! Publisher pipeline
//!
//! Runs when a source account has new content for one provider. For every
//! destination user bound on that provider it picks at most one item and
//! walks it through the gates:
//!
//! 1. freshness: the cached document must not be older than what the link
//!    already handled
//! 2. selection: oldest first within the review window, skipping items from
//!    before the bind, duplicates and items that failed for good
//! 3. filters (new items only): community posts, keywords, likes
//! 4. schedule gate, unless the item is tagged `now`
//! 5. rate gate: minimum spacing between two posts to one destination
//! 6. delivery, with failures counted by the [`CircuitBreaker`]
//!
//! Anything held back lands in the [`Buffer`] and comes back through the
//! queue sweeper.

use secrecy::SecretString;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::buffer::Buffer;
use crate::bus::{command, Bus};
use crate::cache::AccountCache;
use crate::config::PublisherConfig;
use crate::error::{Result, RiverError};
use crate::filter::{FilterRecord, FilterStore, Verdict};
use crate::keys;
use crate::links::LinkStore;
use crate::message_map::{
    classify, token_fingerprint, Delivery, MessageMapStore, MessageRecord, PriorAttempt,
};
use crate::providers::ProviderPublisher;
use crate::store::Store;
use crate::types::{ActivityDocument, ContentItem, Link, MailTemplate, PreparedItem};

/// User option allowing community posts through
pub const PARAM_IN_COMMUNITY: &str = "in_cty";
/// User option overriding the spacing between posts, in minutes
pub const PARAM_TIME_SPACE: &str = "time_space_min";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub min_time_space_min: i64,
    pub review_window_s: i64,
    pub batch_continue_s: i64,
    pub max_message_map: usize,
    pub breaker: CircuitBreaker,
}

impl From<&PublisherConfig> for PipelineConfig {
    fn from(config: &PublisherConfig) -> Self {
        Self {
            min_time_space_min: config.min_time_space_min,
            review_window_s: config.review_window.as_secs() as i64,
            batch_continue_s: config.batch_continue.as_secs() as i64,
            max_message_map: config.max_message_map,
            breaker: CircuitBreaker {
                max_errors: i64::from(config.max_error_count),
                warn_at: i64::from(config.warn_error_count),
            },
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&PublisherConfig::default())
    }
}

/// Escalation of consecutive delivery failures on one link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreaker {
    pub max_errors: i64,
    pub warn_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Record the failure and try again later
    Retry,
    /// As `Retry`, and tell the user once
    Warn,
    /// Give up on the link: notify and unbind
    Trip,
}

impl CircuitBreaker {
    /// Decision for the error count after the latest failure
    pub fn decide(&self, errors: i64) -> BreakerDecision {
        if errors >= self.max_errors {
            BreakerDecision::Trip
        } else if errors == self.warn_at {
            BreakerDecision::Warn
        } else {
            BreakerDecision::Retry
        }
    }
}

/// What happened to one link during a publish pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// The cached document is older than what the link already handled
    Stale,
    NothingPending,
    /// Held by the quiet-hours schedule
    Buffered { item_id: String },
    /// Held by the spacing between posts
    RateLimited { item_id: String, wait_s: i64 },
    Delivered {
        item_id: String,
        message_id: String,
        edit: bool,
    },
    Failed {
        item_id: Option<String>,
        errors: i64,
        decision: BreakerDecision,
    },
}

struct Candidate<'a> {
    item: &'a ContentItem,
    attempt: PriorAttempt,
}

pub struct Pipeline {
    provider: Arc<dyn ProviderPublisher>,
    bus: Bus,
    cache: AccountCache,
    links: LinkStore,
    buffer: Buffer,
    filters: FilterStore,
    messages: MessageMapStore,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(store: Arc<dyn Store>, provider: Arc<dyn ProviderPublisher>, config: PipelineConfig) -> Self {
        Self {
            provider,
            bus: Bus::new(Arc::clone(&store)),
            cache: AccountCache::new(Arc::clone(&store)),
            links: LinkStore::new(Arc::clone(&store)),
            buffer: Buffer::new(Arc::clone(&store)),
            filters: FilterStore::new(Arc::clone(&store)),
            messages: MessageMapStore::new(store, config.max_message_map),
            config,
        }
    }

    pub fn provider(&self) -> &Arc<dyn ProviderPublisher> {
        &self.provider
    }

    /// Publish the cached document of `gid` to every bound user of this provider
    ///
    /// Store failures abort the pass. Other per-link failures are logged and
    /// the remaining links are still processed.
    pub async fn publish(&self, gid: &str, now: i64) -> Result<Vec<(Link, LinkOutcome)>> {
        let Some(doc) = self.cache.document(gid).await? else {
            debug!(gid, provider = self.provider.name(), "No cached document");
            return Ok(Vec::new());
        };

        let mut results = Vec::new();
        for link in self.links.links(gid, self.provider.name()).await? {
            match self.publish_link(&link, &doc, now).await {
                Ok(outcome) => {
                    debug!(link = %link, outcome = ?outcome, "Link processed");
                    results.push((link, outcome));
                }
                Err(e @ RiverError::Store(_)) => return Err(e),
                Err(e) => warn!(link = %link, error = %e, "Publishing failed"),
            }
        }
        Ok(results)
    }

    pub async fn publish_link(&self, link: &Link, doc: &ActivityDocument, now: i64) -> Result<LinkOutcome> {
        if let Some(handled) = self.links.updated(link).await? {
            if doc.updated < handled {
                return Ok(LinkOutcome::Stale);
            }
        }

        let Some(token) = self.provider.token(&link.user).await? else {
            return self.on_failure(link, None, "missing token", "", now).await;
        };
        let fingerprint = token_fingerprint(&token);

        let pending = self.pending_items(link, doc, &fingerprint, now).await?;
        let filter = self.filters.get(link).await?;

        let mut chosen = None;
        for (pos, candidate) in pending.iter().enumerate() {
            if let Some(prepared) = self.prepare(link, candidate, &filter, now).await? {
                chosen = Some((pos, prepared));
                break;
            }
        }
        let Some((pos, prepared)) = chosen else {
            return Ok(LinkOutcome::NothingPending);
        };
        let attempt = &pending[pos].attempt;
        let item_id = prepared.item.id.clone();

        if !prepared.item.is_urgent()
            && self
                .buffer
                .defer(&link.gid, &link.provider, &link.user, now)
                .await?
        {
            self.log(link, now, &format!("held by schedule: {}", item_id)).await?;
            return Ok(LinkOutcome::Buffered { item_id });
        }

        let wait_s = self.remaining_wait(link, now).await?;
        if wait_s > 0 {
            self.buffer
                .defer_for(&link.gid, &link.provider, wait_s, now)
                .await?;
            debug!(link = %link, item = %item_id, wait_s, "Spacing not reached");
            return Ok(LinkOutcome::RateLimited { item_id, wait_s });
        }

        if pos + 1 < pending.len() {
            self.buffer
                .defer_for(&link.gid, &link.provider, self.config.batch_continue_s, now)
                .await?;
        }

        self.deliver(link, &token, &fingerprint, prepared, attempt, now)
            .await
    }

    /// Items still to be sent, oldest first
    async fn pending_items<'a>(
        &self,
        link: &Link,
        doc: &'a ActivityDocument,
        fingerprint: &str,
        now: i64,
    ) -> Result<Vec<Candidate<'a>>> {
        let first_bound = self.links.first_bound(link).await?.unwrap_or(0);
        let window_start = now - self.config.review_window_s;

        let mut items: Vec<&ContentItem> = doc
            .items
            .iter()
            .filter(|i| i.updated >= window_start && i.published >= first_bound)
            .collect();
        items.sort_by(|a, b| a.updated.cmp(&b.updated).then_with(|| a.id.cmp(&b.id)));

        let mut pending = Vec::with_capacity(items.len());
        for item in items {
            let record = self
                .messages
                .get(&link.provider, &link.user, &item.id)
                .await?;
            match classify(record.as_ref(), item.updated, fingerprint) {
                PriorAttempt::Duplicate => {}
                PriorAttempt::PermanentlyFailed => {
                    debug!(link = %link, item = %item.id, "Giving up on item");
                }
                attempt => pending.push(Candidate { item, attempt }),
            }
        }
        Ok(pending)
    }

    /// Apply filters and build the final text; `None` when filtered out
    async fn prepare(
        &self,
        link: &Link,
        candidate: &Candidate<'_>,
        filter: &FilterRecord,
        now: i64,
    ) -> Result<Option<PreparedItem>> {
        let item = candidate.item;
        if let PriorAttempt::Edit { .. } = candidate.attempt {
            let text = filter.with_tagline(item.filter_text().unwrap_or_default().to_string());
            return Ok(Some(PreparedItem {
                item: item.clone(),
                text,
            }));
        }

        if item.community && !self.user_flag(&link.user, PARAM_IN_COMMUNITY).await? {
            self.log(link, now, &format!("filtered {}: community post", item.id))
                .await?;
            return Ok(None);
        }

        match filter.apply(item)? {
            Verdict::Accepted(text) => Ok(Some(PreparedItem {
                item: item.clone(),
                text,
            })),
            Verdict::Rejected(reason) => {
                info!(link = %link, item = %item.id, reason = %reason, "Filtered");
                self.log(link, now, &format!("filtered {}: {}", item.id, reason))
                    .await?;
                Ok(None)
            }
        }
    }

    async fn user_flag(&self, user: &str, name: &str) -> Result<bool> {
        Ok(matches!(
            self.provider.user_param(user, name).await?.as_deref(),
            Some("1" | "true" | "yes" | "on")
        ))
    }

    /// Seconds until the destination may receive another post
    async fn remaining_wait(&self, link: &Link, now: i64) -> Result<i64> {
        let Some(last) = self.links.last_publish(&link.provider, &link.user).await? else {
            return Ok(0);
        };
        let spacing_min = self
            .provider
            .user_param(&link.user, PARAM_TIME_SPACE)
            .await?
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or(self.config.min_time_space_min);
        Ok(spacing_min * 60 - (now - last))
    }

    async fn deliver(
        &self,
        link: &Link,
        token: &SecretString,
        fingerprint: &str,
        prepared: PreparedItem,
        attempt: &PriorAttempt,
        now: i64,
    ) -> Result<LinkOutcome> {
        let item_id = prepared.item.id.clone();
        let item_updated = prepared.item.updated;

        let previous = match attempt {
            PriorAttempt::Edit { message_id } => Some(message_id.as_str()),
            _ => None,
        };
        let replace = match previous {
            Some(old) if self.provider.deletes_before_edit() => {
                if let Err(e) = self.provider.delete(&link.user, old, token).await {
                    warn!(link = %link, message_id = old, error = %e, "Could not delete edited message");
                }
                None
            }
            other => other,
        };

        let result = self
            .provider
            .publish(&link.user, token, &prepared, replace)
            .await;
        self.links.set_updated(link, item_updated).await?;

        let failure = match result {
            Ok(Some(message_id)) => {
                self.links.reset_errors(link).await?;
                self.links
                    .set_last_publish(&link.provider, &link.user, now)
                    .await?;
                self.messages
                    .record(
                        &link.provider,
                        &link.user,
                        &item_id,
                        &MessageRecord {
                            delivery: Delivery::Delivered {
                                message_id: message_id.clone(),
                            },
                            updated: item_updated,
                        },
                    )
                    .await?;
                info!(link = %link, item = %item_id, message_id = %message_id, "Delivered");
                self.log(link, now, &format!("delivered {}", item_id)).await?;
                return Ok(LinkOutcome::Delivered {
                    item_id,
                    message_id,
                    edit: previous.is_some(),
                });
            }
            Ok(None) => "provider declined".to_string(),
            Err(e @ RiverError::Store(_)) => return Err(e),
            Err(e) => e.to_string(),
        };

        let retries = match attempt {
            PriorAttempt::Retry { retries } => *retries,
            _ => 0,
        };
        self.on_failure(link, Some((&prepared.item, retries)), &failure, fingerprint, now)
            .await
    }

    async fn on_failure(
        &self,
        link: &Link,
        item: Option<(&ContentItem, u32)>,
        reason: &str,
        fingerprint: &str,
        now: i64,
    ) -> Result<LinkOutcome> {
        let errors = self.links.incr_errors(link).await?;
        let decision = self.config.breaker.decide(errors);
        let item_id = item.map(|(i, _)| i.id.clone());
        warn!(link = %link, item = ?item_id, errors, reason, decision = ?decision, "Delivery failed");

        let params = serde_json::json!({
            "provider": link.provider,
            "user": link.user,
            "errors": errors,
            "reason": reason,
        });

        match decision {
            BreakerDecision::Trip => {
                self.notify(&link.gid, MailTemplate::AccountUnlinked, &params)
                    .await?;
                self.links.unbind(link, false).await?;
                self.log(link, now, &format!("unlinked after {} errors", errors))
                    .await?;
                return Ok(LinkOutcome::Failed {
                    item_id,
                    errors,
                    decision,
                });
            }
            BreakerDecision::Warn => {
                self.notify(&link.gid, MailTemplate::PublisherError, &params)
                    .await?;
            }
            BreakerDecision::Retry => {}
        }

        if let Some((item, retries)) = item {
            self.messages
                .record(
                    &link.provider,
                    &link.user,
                    &item.id,
                    &MessageRecord {
                        delivery: Delivery::Failed {
                            retries: retries + 1,
                            token_fingerprint: fingerprint.to_string(),
                        },
                        updated: item.updated,
                    },
                )
                .await?;
        }
        self.log(link, now, &format!("error {}: {}", errors, reason))
            .await?;

        Ok(LinkOutcome::Failed {
            item_id,
            errors,
            decision,
        })
    }

    /// Fire-and-forget mail through the bus
    async fn notify(&self, gid: &str, template: MailTemplate, params: &serde_json::Value) -> Result<()> {
        let payload = params.to_string();
        self.bus
            .send_now(keys::MAIL_ALL, command::MAIL_SEND, &[gid, template.name(), &payload])
            .await
    }

    async fn log(&self, link: &Link, now: i64, message: &str) -> Result<()> {
        self.links
            .add_log(&link.gid, now, &format!("{}:{} {}", link.provider, link.user, message))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Message;
    use crate::filter::FilterRecord;
    use crate::providers::mock::MockPublisher;
    use crate::schedule::Schedule;
    use crate::store::MemoryStore;

    const NOW: i64 = 1_704_103_200; // 2024-01-01T10:00:00Z, a Monday

    struct Fixture {
        store: Arc<dyn Store>,
        provider: Arc<MockPublisher>,
        pipeline: Pipeline,
        link: Link,
    }

    async fn setup(provider: MockPublisher) -> Fixture {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let provider = Arc::new(provider);
        let pipeline = Pipeline::new(
            Arc::clone(&store),
            Arc::clone(&provider) as Arc<dyn ProviderPublisher>,
            PipelineConfig::default(),
        );
        let link = Link::new("g1", provider.name(), "alice");
        LinkStore::new(Arc::clone(&store))
            .bind(&link, NOW - 86_400)
            .await
            .unwrap();
        Fixture {
            store,
            provider,
            pipeline,
            link,
        }
    }

    fn item(id: &str, updated: i64) -> ContentItem {
        ContentItem {
            id: id.to_string(),
            updated,
            published: updated,
            description: Some(format!("post {}", id)),
            likes: 10,
            ..Default::default()
        }
    }

    async fn cache_doc(f: &Fixture, items: Vec<ContentItem>) {
        let updated = items.iter().map(|i| i.updated).max().unwrap_or(0);
        AccountCache::new(Arc::clone(&f.store))
            .store_document(
                "g1",
                &ActivityDocument {
                    etag: format!("e{}", updated),
                    updated,
                    items,
                },
            )
            .await
            .unwrap();
    }

    async fn mails(f: &Fixture) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(raw) = f.store.lpop(keys::MAIL_ALL).await.unwrap() {
            if let Message::Command { args, .. } = Message::parse(&raw) {
                out.push(args[1].clone());
            }
        }
        out
    }

    fn only(results: Vec<(Link, LinkOutcome)>) -> LinkOutcome {
        assert_eq!(results.len(), 1);
        results.into_iter().next().unwrap().1
    }

    #[test]
    fn test_breaker_escalation() {
        let breaker = PipelineConfig::default().breaker;
        let decisions: Vec<BreakerDecision> = (1..=7).map(|n| breaker.decide(n)).collect();
        assert_eq!(
            decisions,
            vec![
                BreakerDecision::Retry,
                BreakerDecision::Warn,
                BreakerDecision::Retry,
                BreakerDecision::Retry,
                BreakerDecision::Retry,
                BreakerDecision::Retry,
                BreakerDecision::Trip,
            ]
        );
        assert_eq!(breaker.decide(9), BreakerDecision::Trip);
    }

    #[tokio::test]
    async fn test_delivers_one_item_and_continues_later() {
        let f = setup(MockPublisher::success("twitter")).await;
        cache_doc(&f, vec![item("b", NOW - 60), item("a", NOW - 120)]).await;

        let outcome = only(f.pipeline.publish("g1", NOW).await.unwrap());
        assert!(matches!(outcome, LinkOutcome::Delivered { ref item_id, edit: false, .. } if item_id == "a"));

        // More is pending: come back in a minute
        let buffer = Buffer::new(Arc::clone(&f.store));
        assert_eq!(buffer.wake_at("g1", "twitter").await.unwrap(), Some(NOW + 60));
        assert_eq!(f.provider.delivered().len(), 1);
    }

    #[tokio::test]
    async fn test_rate_gate_rebuffers_remaining_wait() {
        let f = setup(MockPublisher::success("twitter")).await;
        cache_doc(&f, vec![item("a", NOW - 10)]).await;
        let first = only(f.pipeline.publish("g1", NOW).await.unwrap());
        assert!(matches!(first, LinkOutcome::Delivered { .. }));

        cache_doc(&f, vec![item("a", NOW - 10), item("b", NOW + 30)]).await;
        let second = only(f.pipeline.publish("g1", NOW + 60).await.unwrap());
        assert_eq!(
            second,
            LinkOutcome::RateLimited {
                item_id: "b".to_string(),
                wait_s: 240
            }
        );

        let buffer = Buffer::new(Arc::clone(&f.store));
        assert_eq!(buffer.wake_at("g1", "twitter").await.unwrap(), Some(NOW + 300));
        assert_eq!(f.provider.delivered().len(), 1);

        // Once the spacing has passed the item goes out
        let third = only(f.pipeline.publish("g1", NOW + 300).await.unwrap());
        assert!(matches!(third, LinkOutcome::Delivered { ref item_id, .. } if item_id == "b"));
    }

    #[tokio::test]
    async fn test_user_spacing_override() {
        let f = setup(MockPublisher::success("twitter")).await;
        f.provider.set_param(PARAM_TIME_SPACE, "1");
        cache_doc(&f, vec![item("a", NOW - 10)]).await;
        f.pipeline.publish("g1", NOW).await.unwrap();

        cache_doc(&f, vec![item("a", NOW - 10), item("b", NOW + 5)]).await;
        let outcome = only(f.pipeline.publish("g1", NOW + 61).await.unwrap());
        assert!(matches!(outcome, LinkOutcome::Delivered { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_is_skipped_and_edit_replaces() {
        let f = setup(MockPublisher::success("twitter")).await;
        cache_doc(&f, vec![item("a", NOW - 10)]).await;
        f.pipeline.publish("g1", NOW).await.unwrap();

        let again = only(f.pipeline.publish("g1", NOW + 600).await.unwrap());
        assert_eq!(again, LinkOutcome::NothingPending);

        // Same item, changed content
        cache_doc(&f, vec![item("a", NOW + 700)]).await;
        let edited = only(f.pipeline.publish("g1", NOW + 800).await.unwrap());
        assert!(matches!(edited, LinkOutcome::Delivered { edit: true, .. }));
        assert_eq!(f.provider.deleted(), vec!["twitter:msg-1"]);
        assert_eq!(f.provider.published()[1].existing_message_id, None);
    }

    #[tokio::test]
    async fn test_edit_in_place_when_supported() {
        let f = setup(MockPublisher::editing("linkedin")).await;
        cache_doc(&f, vec![item("a", NOW - 10)]).await;
        f.pipeline.publish("g1", NOW).await.unwrap();
        cache_doc(&f, vec![item("a", NOW + 700)]).await;
        f.pipeline.publish("g1", NOW + 800).await.unwrap();

        assert!(f.provider.deleted().is_empty());
        assert_eq!(
            f.provider.published()[1].existing_message_id.as_deref(),
            Some("linkedin:msg-1")
        );
    }

    #[tokio::test]
    async fn test_stale_document_and_pre_bind_items() {
        let f = setup(MockPublisher::success("twitter")).await;
        let links = LinkStore::new(Arc::clone(&f.store));
        links.set_updated(&f.link, NOW).await.unwrap();
        cache_doc(&f, vec![item("a", NOW - 100)]).await;
        assert_eq!(only(f.pipeline.publish("g1", NOW).await.unwrap()), LinkOutcome::Stale);

        let f = setup(MockPublisher::success("twitter")).await;
        let mut old = item("old", NOW);
        old.published = NOW - 2 * 86_400;
        cache_doc(&f, vec![old]).await;
        assert_eq!(
            only(f.pipeline.publish("g1", NOW).await.unwrap()),
            LinkOutcome::NothingPending
        );
    }

    #[tokio::test]
    async fn test_filters_apply_to_new_items() {
        let f = setup(MockPublisher::success("twitter")).await;
        FilterStore::new(Arc::clone(&f.store))
            .set(
                &f.link,
                &FilterRecord {
                    keyword: Some("#x".to_string()),
                    strip: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mut tagged = item("b", NOW - 10);
        tagged.description = Some("hello #x world".to_string());
        let mut community = item("c", NOW - 5);
        community.description = Some("#x in a community".to_string());
        community.community = true;
        cache_doc(&f, vec![item("a", NOW - 20), tagged, community]).await;

        let outcome = only(f.pipeline.publish("g1", NOW).await.unwrap());
        assert!(matches!(outcome, LinkOutcome::Delivered { ref item_id, .. } if item_id == "b"));
        assert_eq!(f.provider.published()[0].text, "hello world");

        let log = LinkStore::new(Arc::clone(&f.store)).logs("g1").await.unwrap();
        assert!(log.iter().any(|l| l.contains("filtered a")));
    }

    #[tokio::test]
    async fn test_community_allowed_by_user_option() {
        let f = setup(MockPublisher::success("twitter")).await;
        f.provider.set_param(PARAM_IN_COMMUNITY, "1");
        let mut community = item("c", NOW - 5);
        community.community = true;
        cache_doc(&f, vec![community]).await;
        assert!(matches!(
            only(f.pipeline.publish("g1", NOW).await.unwrap()),
            LinkOutcome::Delivered { .. }
        ));
    }

    #[tokio::test]
    async fn test_schedule_gate_and_now_tag() {
        let f = setup(MockPublisher::success("twitter")).await;
        let buffer = Buffer::new(Arc::clone(&f.store));
        // Only Monday 20:00 allowed; NOW is Monday 10:00
        buffer
            .set_schedule("g1", "twitter", "alice", Some(&Schedule::new(true, [20]).unwrap()))
            .await
            .unwrap();
        cache_doc(&f, vec![item("a", NOW - 10)]).await;

        let held = only(f.pipeline.publish("g1", NOW).await.unwrap());
        assert_eq!(held, LinkOutcome::Buffered { item_id: "a".to_string() });
        let wake = buffer.wake_at("g1", "twitter").await.unwrap().unwrap();
        assert!(wake >= NOW + 10 * 3600 && wake < NOW + 10 * 3600 + 1000);

        let mut urgent = item("u", NOW - 5);
        urgent.tags.push("now".to_string());
        cache_doc(&f, vec![urgent]).await;
        assert!(matches!(
            only(f.pipeline.publish("g1", NOW).await.unwrap()),
            LinkOutcome::Delivered { .. }
        ));
    }

    #[tokio::test]
    async fn test_breaker_warns_once_then_unlinks() {
        let f = setup(MockPublisher::success("tumblr")).await;
        f.provider.set_token(None);
        cache_doc(&f, vec![item("a", NOW - 10)]).await;

        let mut notified = Vec::new();
        for attempt in 1..=7 {
            let outcome = only(f.pipeline.publish("g1", NOW + attempt).await.unwrap());
            assert!(matches!(outcome, LinkOutcome::Failed { errors, .. } if errors == attempt));
            notified.push(mails(&f).await);
            let bound = LinkStore::new(Arc::clone(&f.store))
                .is_bound(&f.link)
                .await
                .unwrap();
            assert_eq!(bound, attempt < 7, "attempt {}", attempt);
        }

        assert!(notified[0].is_empty());
        assert_eq!(notified[1], vec!["publisher_error"]);
        assert!(notified[2..6].iter().all(Vec::is_empty));
        assert_eq!(notified[6], vec!["account_unlinked"]);
        assert!(f.pipeline.publish("g1", NOW + 8).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_item_retried_once_then_dropped() {
        let f = setup(MockPublisher::failing("flickr")).await;
        cache_doc(&f, vec![item("a", NOW - 10)]).await;

        for n in 0..2 {
            let outcome = only(f.pipeline.publish("g1", NOW + n).await.unwrap());
            assert!(matches!(outcome, LinkOutcome::Failed { .. }));
        }
        let record = MessageMapStore::new(Arc::clone(&f.store), 128)
            .get("flickr", "alice", "a")
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(record.delivery, Delivery::Failed { retries: 2, .. }));

        assert_eq!(
            only(f.pipeline.publish("g1", NOW + 5).await.unwrap()),
            LinkOutcome::NothingPending
        );
        assert_eq!(f.provider.publish_call_count(), 2);

        // A new token earns another attempt, and success resets the counter
        f.provider.set_token(Some("fresh"));
        f.provider.set_succeeds(true);
        assert!(matches!(
            only(f.pipeline.publish("g1", NOW + 6).await.unwrap()),
            LinkOutcome::Delivered { .. }
        ));
        assert_eq!(
            LinkStore::new(Arc::clone(&f.store)).errors(&f.link).await.unwrap(),
            0
        );
    }
}
