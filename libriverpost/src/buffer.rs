//! Quiet-hours buffer
//!
//! Postings that must not go out now are parked in one global sorted set,
//! member `gid:provider`, scored by the epoch at which they should be
//! retried. The queue sweeper pops due members and re-injects a `publish`
//! command. Two producers write here: the schedule gate (`defer`) and the
//! rate gate (`defer_for`). The last write for a member wins.

use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schedule::{hour_of_week, Schedule};
use crate::store::Store;

/// Upper bound (exclusive) of the random offset added to schedule wakes
pub const WAKE_JITTER_S: i64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferEntry {
    pub gid: String,
    pub provider: String,
}

#[derive(Clone)]
pub struct Buffer {
    store: Arc<dyn Store>,
}

impl Buffer {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn schedule(&self, gid: &str, provider: &str, user: &str) -> Result<Option<Schedule>> {
        let field = keys::schedule_field(gid, provider, user);
        match self.store.hget(keys::SCHEDULE_STORE, &field).await? {
            Some(raw) => {
                let schedule = serde_json::from_str(&raw).map_err(StoreError::Serialization)?;
                Ok(Some(schedule))
            }
            None => Ok(None),
        }
    }

    /// Store a schedule, or remove it with `None`
    pub async fn set_schedule(
        &self,
        gid: &str,
        provider: &str,
        user: &str,
        schedule: Option<&Schedule>,
    ) -> Result<()> {
        let field = keys::schedule_field(gid, provider, user);
        match schedule {
            Some(schedule) => {
                let raw = serde_json::to_string(schedule).map_err(StoreError::Serialization)?;
                self.store.hset(keys::SCHEDULE_STORE, &field, &raw).await
            }
            None => self.store.hdel(keys::SCHEDULE_STORE, &field).await.map(|_| ()),
        }
    }

    /// Hold the posting back if the link's schedule does not allow this hour
    ///
    /// Returns true when the posting was buffered.
    pub async fn defer(&self, gid: &str, provider: &str, user: &str, now: i64) -> Result<bool> {
        let jitter = rand::thread_rng().gen_range(0..WAKE_JITTER_S);
        self.defer_with_jitter(gid, provider, user, now, jitter).await
    }

    pub(crate) async fn defer_with_jitter(
        &self,
        gid: &str,
        provider: &str,
        user: &str,
        now: i64,
        jitter: i64,
    ) -> Result<bool> {
        let schedule = match self.schedule(gid, provider, user).await? {
            Some(s) if s.is_active() => s,
            _ => return Ok(false),
        };

        let hour = hour_of_week(now)?;
        if schedule.contains(hour) {
            return Ok(false);
        }
        let Some(hours) = schedule.hours_to_next_window(hour) else {
            return Ok(false);
        };

        let top_of_hour = now - now.rem_euclid(3600);
        let wake = top_of_hour + jitter + i64::from(hours) * 3600;
        self.store
            .zadd(keys::BUFFER_SET, &keys::buffer_member(gid, provider), wake)
            .await?;
        info!(gid, provider, user, hours, wake, "Buffered until next schedule window");
        Ok(true)
    }

    /// Unconditionally retry `delay_s` seconds from now; returns the wake epoch
    pub async fn defer_for(&self, gid: &str, provider: &str, delay_s: i64, now: i64) -> Result<i64> {
        let wake = now + delay_s;
        self.store
            .zadd(keys::BUFFER_SET, &keys::buffer_member(gid, provider), wake)
            .await?;
        debug!(gid, provider, delay_s, "Buffered for retry");
        Ok(wake)
    }

    pub async fn wake_at(&self, gid: &str, provider: &str) -> Result<Option<i64>> {
        self.store
            .zscore(keys::BUFFER_SET, &keys::buffer_member(gid, provider))
            .await
    }

    /// Remove and return every entry due within `lookahead_s` of `now`
    pub async fn due_entries(&self, lookahead_s: i64, now: i64) -> Result<Vec<BufferEntry>> {
        let due = self
            .store
            .zrange_by_score(keys::BUFFER_SET, now + lookahead_s, None)
            .await?;

        if due.is_empty() {
            match self.store.zfirst(keys::BUFFER_SET).await? {
                None => debug!("Buffer empty"),
                Some((member, wake)) => debug!(next = %member, in_s = wake - now, "Nothing due"),
            }
            return Ok(Vec::new());
        }

        let mut entries = Vec::with_capacity(due.len());
        for (member, _) in due {
            // Another sweeper may have taken it
            if !self.store.zrem(keys::BUFFER_SET, &member).await? {
                continue;
            }
            match member.rsplit_once(':') {
                Some((gid, provider)) if !gid.is_empty() && !provider.is_empty() => {
                    entries.push(BufferEntry {
                        gid: gid.to_string(),
                        provider: provider.to_string(),
                    })
                }
                _ => warn!(member = %member, "Dropping malformed buffer entry"),
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::DateTime;

    fn setup() -> Buffer {
        Buffer::new(Arc::new(MemoryStore::new()))
    }

    fn at(rfc3339: &str) -> i64 {
        DateTime::parse_from_rfc3339(rfc3339).unwrap().timestamp()
    }

    fn business_hours() -> Schedule {
        Schedule::new(true, (0..5u8).flat_map(|d| (9..=17u8).map(move |h| d * 24 + h))).unwrap()
    }

    #[tokio::test]
    async fn test_no_schedule_never_buffers() {
        let buffer = setup();
        let now = at("2024-01-01T20:15:00Z");
        assert!(!buffer.defer("1", "twitter", "u", now).await.unwrap());

        let disabled = Schedule::new(false, [3]).unwrap();
        buffer
            .set_schedule("1", "twitter", "u", Some(&disabled))
            .await
            .unwrap();
        assert!(!buffer.defer("1", "twitter", "u", now).await.unwrap());
        assert_eq!(buffer.wake_at("1", "twitter").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_in_schedule_does_not_buffer() {
        let buffer = setup();
        buffer
            .set_schedule("1", "twitter", "u", Some(&business_hours()))
            .await
            .unwrap();
        let now = at("2024-01-01T10:15:00Z");
        assert!(!buffer.defer("1", "twitter", "u", now).await.unwrap());
    }

    #[tokio::test]
    async fn test_evening_waits_for_next_morning() {
        let buffer = setup();
        buffer
            .set_schedule("1", "twitter", "u", Some(&business_hours()))
            .await
            .unwrap();

        // Monday 20:15 -> Tuesday 09:00 plus jitter
        let now = at("2024-01-01T20:15:00Z");
        assert!(buffer.defer("1", "twitter", "u", now).await.unwrap());

        let wake = buffer.wake_at("1", "twitter").await.unwrap().unwrap();
        let tuesday_nine = at("2024-01-02T09:00:00Z");
        assert!(wake >= tuesday_nine);
        assert!(wake < tuesday_nine + WAKE_JITTER_S);
        assert_eq!(wake.rem_euclid(3600), wake - tuesday_nine);
    }

    #[tokio::test]
    async fn test_wake_offset_equals_jitter() {
        let buffer = setup();
        buffer
            .set_schedule("1", "flickr", "u", Some(&Schedule::new(true, [2, 5]).unwrap()))
            .await
            .unwrap();
        // Monday 06:42:10 -> next window is hour 2 of next week, 164 hours on
        let now = at("2024-01-01T06:42:10Z");
        assert!(buffer
            .defer_with_jitter("1", "flickr", "u", now, 777)
            .await
            .unwrap());
        let wake = buffer.wake_at("1", "flickr").await.unwrap().unwrap();
        assert_eq!(wake, at("2024-01-01T06:00:00Z") + 164 * 3600 + 777);
        assert_eq!(wake.rem_euclid(3600), 777);
    }

    #[tokio::test]
    async fn test_due_entries_pops_only_due() {
        let buffer = setup();
        buffer.defer_for("1", "twitter", 10, 1000).await.unwrap();
        buffer.defer_for("2", "tumblr", 100, 1000).await.unwrap();
        buffer.defer_for("3", "twitter", 5000, 1000).await.unwrap();

        let due = buffer.due_entries(50, 1060).await.unwrap();
        assert_eq!(
            due,
            vec![
                BufferEntry {
                    gid: "1".to_string(),
                    provider: "twitter".to_string()
                },
                BufferEntry {
                    gid: "2".to_string(),
                    provider: "tumblr".to_string()
                },
            ]
        );
        assert!(buffer.due_entries(50, 1060).await.unwrap().is_empty());
        assert_eq!(buffer.wake_at("3", "twitter").await.unwrap(), Some(6000));
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let buffer = setup();
        buffer.defer_for("1", "twitter", 600, 0).await.unwrap();
        buffer.defer_for("1", "twitter", 60, 0).await.unwrap();
        assert_eq!(buffer.wake_at("1", "twitter").await.unwrap(), Some(60));
    }

    #[tokio::test]
    async fn test_schedule_delete() {
        let buffer = setup();
        let schedule = Schedule::new(true, [1, 2]).unwrap();
        buffer
            .set_schedule("1", "twitter", "u", Some(&schedule))
            .await
            .unwrap();
        assert_eq!(
            buffer.schedule("1", "twitter", "u").await.unwrap(),
            Some(schedule)
        );
        buffer.set_schedule("1", "twitter", "u", None).await.unwrap();
        assert_eq!(buffer.schedule("1", "twitter", "u").await.unwrap(), None);
    }
}
