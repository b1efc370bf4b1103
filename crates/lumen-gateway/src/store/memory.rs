//! In-process backend
//!
//! Keeps everything in DashMaps and fans pub/sub out over a broadcast channel.
//! Only meaningful for a single gateway process. Failures can be injected per
//! key prefix or topic so callers' error paths can be exercised.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};

use super::{KvStore, TopicMessage};
use crate::error::{StoreError, StoreResult};

const BROADCAST_CAPACITY: usize = 1024;
const SUBSCRIBE_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
struct StringValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StringValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug)]
pub struct MemoryStore {
    strings: DashMap<String, StringValue>,
    hashes: DashMap<String, HashMap<String, String>>,
    sets: DashMap<String, HashSet<String>>,
    topics: broadcast::Sender<TopicMessage>,
    fail_all: AtomicBool,
    failing_prefixes: RwLock<Vec<String>>,
    failing_topics: RwLock<HashSet<String>>,
    record_publishes: bool,
    published: RwLock<Vec<TopicMessage>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (topics, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            strings: DashMap::new(),
            hashes: DashMap::new(),
            sets: DashMap::new(),
            topics,
            fail_all: AtomicBool::new(false),
            failing_prefixes: RwLock::new(Vec::new()),
            failing_topics: RwLock::new(HashSet::new()),
            record_publishes: false,
            published: RwLock::new(Vec::new()),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same as [`MemoryStore::new`] but keeps a log of every publish,
    /// readable through [`MemoryStore::published`].
    pub fn recording() -> Self {
        Self {
            record_publishes: true,
            ..Self::default()
        }
    }

    /// Makes every operation fail until reset.
    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Makes operations on keys starting with `prefix` fail.
    pub fn fail_keys_with_prefix(&self, prefix: impl Into<String>) {
        self.failing_prefixes.write().push(prefix.into());
    }

    /// Makes publishing to `topic` fail.
    pub fn fail_topic(&self, topic: impl Into<String>) {
        self.failing_topics.write().insert(topic.into());
    }

    /// Every successful publish so far, in order. Always empty unless the
    /// store was built with [`MemoryStore::recording`].
    pub fn published(&self) -> Vec<TopicMessage> {
        self.published.read().clone()
    }

    /// Remaining time to live of a string key.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.strings
            .get(key)
            .filter(|v| v.is_live(now))
            .and_then(|v| v.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    fn check(&self, key: &str) -> StoreResult<()> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        if self.failing_prefixes.read().iter().any(|p| key.starts_with(p.as_str())) {
            return Err(StoreError::Unavailable(format!("injected failure for {}", key)));
        }
        Ok(())
    }

    fn live_string(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        match self.strings.get(key) {
            Some(v) if v.is_live(now) => Some(v.value.clone()),
            _ => None,
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check(key)?;
        Ok(self.live_string(key))
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.check(key)?;
        self.strings.insert(
            key.to_string(),
            StringValue {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.check(key)?;
        self.strings.insert(
            key.to_string(),
            StringValue {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.check(key)?;
        let now = Instant::now();
        let mut entry = self.strings.entry(key.to_string()).or_insert(StringValue {
            value: String::new(),
            expires_at: Some(now),
        });
        if entry.is_live(now) {
            return Ok(false);
        }
        *entry = StringValue {
            value: value.to_string(),
            expires_at: Some(now + ttl),
        };
        Ok(true)
    }

    async fn incr_by(&self, key: &str, delta: i64, ttl: Option<Duration>) -> StoreResult<i64> {
        self.check(key)?;
        let now = Instant::now();
        let mut entry = self.strings.entry(key.to_string()).or_insert(StringValue {
            value: "0".to_string(),
            expires_at: None,
        });

        let current = if entry.is_live(now) {
            entry
                .value
                .parse::<i64>()
                .map_err(|_| StoreError::InvalidValue {
                    key: key.to_string(),
                    value: entry.value.clone(),
                })?
        } else {
            // expired keys restart from zero and lose their old expiry
            entry.expires_at = None;
            0
        };

        let next = current + delta;
        entry.value = next.to_string();
        if let Some(ttl) = ttl {
            entry.expires_at = Some(now + ttl);
        }
        Ok(next)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.check(key)?;
        Ok(self.live_string(key).is_some()
            || self.hashes.get(key).is_some_and(|h| !h.is_empty())
            || self.sets.get(key).is_some_and(|s| !s.is_empty()))
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        self.check(key)?;
        self.strings.remove(key);
        self.hashes.remove(key);
        self.sets.remove(key);
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.check(key)?;
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.check(key)?;
        Ok(self.hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<()> {
        self.check(key)?;
        if let Some(mut hash) = self.hashes.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.check(key)?;
        Ok(self.hashes.get(key).map(|h| h.value().clone()).unwrap_or_default())
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<()> {
        self.check(key)?;
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<()> {
        self.check(key)?;
        if let Some(mut set) = self.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.check(key)?;
        let mut members: Vec<String> = self
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check(key)?;
        Ok(self.sets.get(key).is_some_and(|s| s.contains(member)))
    }

    async fn scard(&self, key: &str) -> StoreResult<usize> {
        self.check(key)?;
        Ok(self.sets.get(key).map_or(0, |s| s.len()))
    }

    async fn publish(&self, topic: &str, payload: &str) -> StoreResult<()> {
        self.check(topic)?;
        if self.failing_topics.read().contains(topic) {
            return Err(StoreError::Unavailable(format!("injected failure for {}", topic)));
        }
        let message = TopicMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
        };
        if self.record_publishes {
            self.published.write().push(message.clone());
        }
        // no subscribers is not an error
        let _ = self.topics.send(message);
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> StoreResult<mpsc::Receiver<TopicMessage>> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }

        let mut source = self.topics.subscribe();
        let wanted: HashSet<String> = topics.iter().cloned().collect();
        let (tx, rx) = mpsc::channel(SUBSCRIBE_BUFFER);

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = tx.closed() => return,
                    message = source.recv() => message,
                };
                match message {
                    Ok(message) if wanted.contains(&message.topic) => {
                        if tx.send(message).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Memory subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(rx)
    }

    async fn ping(&self) -> StoreResult<()> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}
