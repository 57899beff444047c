//! In-process store

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

use super::Store;
use crate::error::{Result, StoreError};

#[derive(Default)]
struct State {
    hashes: HashMap<String, BTreeMap<String, String>>,
    zsets: HashMap<String, HashMap<String, i64>>,
    sets: HashMap<String, BTreeSet<String>>,
    lists: HashMap<String, VecDeque<String>>,
}

impl State {
    fn sorted(&self, key: &str) -> Vec<(String, i64)> {
        let mut entries: Vec<(String, i64)> = self
            .zsets
            .get(key)
            .map(|z| z.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }

    fn pop_first(&mut self, keys: &[String]) -> Option<(String, String)> {
        for key in keys {
            if let Some(value) = self.lists.get_mut(key).and_then(VecDeque::pop_front) {
                return Some((key.clone(), value));
            }
        }
        None
    }
}

/// Store kept in process memory
///
/// Blocking pops are woken by pushes instead of polling.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    pushed: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| {
            StoreError::Corrupt {
                key: "*".to_string(),
                reason: "memory store lock poisoned".to_string(),
            }
            .into()
        })
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self.state()?.hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.state()?
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut state = self.state()?;
        let removed = match state.hashes.get_mut(key) {
            Some(h) => h.remove(field).is_some(),
            None => false,
        };
        if state.hashes.get(key).is_some_and(BTreeMap::is_empty) {
            state.hashes.remove(key);
        }
        Ok(removed)
    }

    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>> {
        Ok(self.state()?.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut state = self.state()?;
        let slot = state
            .hashes
            .entry(key.to_string())
            .or_default()
            .entry(field.to_string())
            .or_insert_with(|| "0".to_string());
        let current: i64 = slot.parse().map_err(|_| StoreError::Corrupt {
            key: format!("{}/{}", key, field),
            reason: format!("not an integer: {}", slot),
        })?;
        let next = current + delta;
        *slot = next.to_string();
        Ok(next)
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()> {
        self.state()?
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self
            .state()?
            .zsets
            .get_mut(key)
            .is_some_and(|z| z.remove(member).is_some()))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        max: i64,
        limit: Option<usize>,
    ) -> Result<Vec<(String, i64)>> {
        let entries = self.state()?.sorted(key);
        Ok(entries
            .into_iter()
            .take_while(|(_, score)| *score <= max)
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn zfirst(&self, key: &str) -> Result<Option<(String, i64)>> {
        Ok(self.state()?.sorted(key).into_iter().next())
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>> {
        Ok(self.state()?.zsets.get(key).and_then(|z| z.get(member).copied()))
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        Ok(self.state()?.zsets.get(key).map_or(0, HashMap::len))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self
            .state()?
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self.state()?.sets.get_mut(key).is_some_and(|s| s.remove(member)))
    }

    async fn spop(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state()?.sets.get_mut(key).and_then(BTreeSet::pop_first))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .state()?
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn scard(&self, key: &str) -> Result<usize> {
        Ok(self.state()?.sets.get(key).map_or(0, BTreeSet::len))
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<usize> {
        let len = {
            let mut state = self.state()?;
            let list = state.lists.entry(key.to_string()).or_default();
            list.push_back(value.to_string());
            list.len()
        };
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<usize> {
        let len = {
            let mut state = self.state()?;
            let list = state.lists.entry(key.to_string()).or_default();
            list.push_front(value.to_string());
            list.len()
        };
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state()?.lists.get_mut(key).and_then(VecDeque::pop_front))
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        Ok(self.state()?.lists.get(key).map_or(0, VecDeque::len))
    }

    async fn lrange(&self, key: &str, count: usize) -> Result<Vec<String>> {
        Ok(self
            .state()?
            .lists
            .get(key)
            .map(|l| l.iter().take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn ltrim(&self, key: &str, keep: usize) -> Result<()> {
        if let Some(list) = self.state()?.lists.get_mut(key) {
            list.truncate(keep);
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut state = self.state()?;
        state.hashes.remove(key);
        state.zsets.remove(key);
        state.sets.remove(key);
        state.lists.remove(key);
        Ok(())
    }

    async fn blpop(&self, keys: &[String], timeout: Duration) -> Result<Option<(String, String)>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            // Register before checking so a push in between is not missed.
            notified.as_mut().enable();

            let hit = self.state()?.pop_first(keys);
            if hit.is_some() {
                return Ok(hit);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}
