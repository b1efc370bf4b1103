//! Presence tracking
//!
//! Two things live in the shared store:
//! - the registry of gateway processes and their last report time
//!   (hash `server_ids`, expiring set `server_ids_expire`)
//! - per-process client bindings, used by the fanout router to find which
//!   processes host a user
//!
//! Timestamps are unix seconds.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ClientId;
use crate::error::StoreResult;
use crate::store::KvStore;

/// 正在运行的服务
pub const SERVER_KEY: &str = "server_ids";
/// 已超时的服务
pub const SERVER_EXPIRE_KEY: &str = "server_ids_expire";

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    /// Reported within the overtime window.
    Live,
    /// Silent for at least the overtime window.
    Expired,
    All,
}

/// Registry of gateway processes.
#[derive(Clone)]
pub struct ServerRegistry {
    store: Arc<dyn KvStore>,
    overtime: Duration,
}

impl std::fmt::Debug for ServerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRegistry")
            .field("overtime", &self.overtime)
            .finish()
    }
}

impl ServerRegistry {
    pub fn new(store: Arc<dyn KvStore>, overtime: Duration) -> Self {
        Self { store, overtime }
    }

    /// 更新服务心跳时间
    pub async fn set(&self, sid: &str, now: i64) -> StoreResult<()> {
        if let Err(e) = self.unmark_expired(sid).await {
            debug!(sid, "Failed to clear expiring mark: {}", e);
        }
        self.store.hset(SERVER_KEY, sid, &now.to_string()).await
    }

    pub async fn del(&self, sid: &str) -> StoreResult<()> {
        self.store.hdel(SERVER_KEY, sid).await
    }

    /// Server ids in `status` as of `now`, sorted. Unparsable entries are skipped.
    pub async fn all(&self, status: ServerStatus, now: i64) -> StoreResult<Vec<String>> {
        let overtime = i64::try_from(self.overtime.as_secs()).unwrap_or(i64::MAX);
        let servers = self.store.hgetall(SERVER_KEY).await?;

        let mut ids: Vec<String> = servers
            .into_iter()
            .filter_map(|(sid, value)| {
                let reported = value.parse::<i64>().ok()?;
                let live = now - reported < overtime;
                let keep = match status {
                    ServerStatus::Live => live,
                    ServerStatus::Expired => !live,
                    ServerStatus::All => true,
                };
                keep.then_some(sid)
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    pub async fn live(&self) -> StoreResult<Vec<String>> {
        self.all(ServerStatus::Live, now_secs()).await
    }

    pub async fn mark_expired(&self, sid: &str) -> StoreResult<()> {
        self.store.sadd(SERVER_EXPIRE_KEY, sid).await
    }

    pub async fn unmark_expired(&self, sid: &str) -> StoreResult<()> {
        self.store.srem(SERVER_EXPIRE_KEY, sid).await
    }

    pub async fn expired_marks(&self) -> StoreResult<Vec<String>> {
        self.store.smembers(SERVER_EXPIRE_KEY).await
    }
}

/// Presence bookkeeping for clients, driven by the client lifecycle.
#[async_trait]
pub trait ClientStorage: Send + Sync {
    async fn bind(&self, channel: &str, cid: ClientId, uid: i64) -> StoreResult<()>;

    async fn unbind(&self, channel: &str, cid: ClientId) -> StoreResult<()>;
}

/// Client bindings of one gateway process.
#[derive(Clone)]
pub struct ClientBindings {
    store: Arc<dyn KvStore>,
    sid: String,
}

impl std::fmt::Debug for ClientBindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBindings")
            .field("sid", &self.sid)
            .finish()
    }
}

impl ClientBindings {
    pub fn new(store: Arc<dyn KvStore>, sid: impl Into<String>) -> Self {
        Self {
            store,
            sid: sid.into(),
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    fn client_key(sid: &str, channel: &str) -> String {
        format!("ws:{}:{}:client", sid, channel)
    }

    fn user_key(sid: &str, channel: &str, uid: i64) -> String {
        format!("ws:{}:{}:user:{}", sid, channel, uid)
    }

    /// 判断用户是否在指定服务的渠道上在线
    pub async fn is_online_on(&self, sid: &str, channel: &str, uid: i64) -> StoreResult<bool> {
        Ok(self.store.scard(&Self::user_key(sid, channel, uid)).await? > 0)
    }

    pub async fn is_online(&self, channel: &str, uid: i64) -> StoreResult<bool> {
        self.is_online_on(&self.sid, channel, uid).await
    }
}

#[async_trait]
impl ClientStorage for ClientBindings {
    async fn bind(&self, channel: &str, cid: ClientId, uid: i64) -> StoreResult<()> {
        let cid = cid.to_string();
        self.store
            .hset(&Self::client_key(&self.sid, channel), &cid, &uid.to_string())
            .await?;
        self.store
            .sadd(&Self::user_key(&self.sid, channel, uid), &cid)
            .await
    }

    async fn unbind(&self, channel: &str, cid: ClientId) -> StoreResult<()> {
        let client_key = Self::client_key(&self.sid, channel);
        let cid = cid.to_string();

        let Some(uid) = self.store.hget(&client_key, &cid).await? else {
            return Ok(());
        };
        self.store.hdel(&client_key, &cid).await?;

        match uid.parse::<i64>() {
            Ok(uid) => {
                self.store
                    .srem(&Self::user_key(&self.sid, channel, uid), &cid)
                    .await
            }
            Err(_) => {
                warn!(cid = %cid, uid = %uid, "Binding with unparsable uid");
                Ok(())
            }
        }
    }
}

/// Periodically reports this process as live.
pub struct PresenceReporter {
    registry: ServerRegistry,
    sid: String,
    interval: Duration,
}

impl PresenceReporter {
    pub fn new(registry: ServerRegistry, sid: impl Into<String>, interval: Duration) -> Self {
        Self {
            registry,
            sid: sid.into(),
            interval,
        }
    }

    /// One report: refresh our heartbeat, then flag every overtime peer.
    pub async fn report(&self, now: i64) -> StoreResult<()> {
        self.registry.set(&self.sid, now).await?;

        for sid in self.registry.all(ServerStatus::Expired, now).await? {
            if sid == self.sid {
                continue;
            }
            if let Err(e) = self.registry.mark_expired(&sid).await {
                warn!(sid = %sid, "Failed to mark server expiring: {}", e);
            }
        }
        Ok(())
    }

    /// Reports every interval; de-lists this process once cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(sid = %self.sid, "Presence reporter started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.report(now_secs()).await {
                        warn!(sid = %self.sid, "Presence report failed: {}", e);
                    }
                }
            }
        }

        if let Err(e) = self.registry.del(&self.sid).await {
            warn!(sid = %self.sid, "Failed to de-list server: {}", e);
        }
        info!(sid = %self.sid, "Presence reporter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn registry(store: &Arc<MemoryStore>) -> ServerRegistry {
        ServerRegistry::new(store.clone(), Duration::from_secs(50))
    }

    #[tokio::test]
    async fn test_live_and_expired_split_on_overtime() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let now = 1_000_000;

        registry.set("a", now - 10).await.unwrap();
        registry.set("b", now - 50).await.unwrap();
        registry.set("c", now - 49).await.unwrap();
        store.hset(SERVER_KEY, "broken", "x").await.unwrap();

        assert_eq!(registry.all(ServerStatus::Live, now).await.unwrap(), vec!["a", "c"]);
        assert_eq!(registry.all(ServerStatus::Expired, now).await.unwrap(), vec!["b"]);
        assert_eq!(registry.all(ServerStatus::All, now).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_report_marks_peers_and_clears_self() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let now = 1_000_000;

        registry.set("old", now - 100).await.unwrap();
        registry.mark_expired("me").await.unwrap();

        let reporter = PresenceReporter::new(registry.clone(), "me", Duration::from_secs(10));
        reporter.report(now).await.unwrap();

        assert_eq!(registry.expired_marks().await.unwrap(), vec!["old"]);
        assert_eq!(registry.all(ServerStatus::Live, now).await.unwrap(), vec!["me"]);
    }

    #[tokio::test]
    async fn test_reporter_delists_on_cancel() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let reporter = PresenceReporter::new(registry.clone(), "me", Duration::from_millis(5));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(reporter.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.live().await.unwrap(), vec!["me"]);

        cancel.cancel();
        task.await.unwrap();
        assert!(registry.all(ServerStatus::All, now_secs()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bind_and_unbind() {
        let store = Arc::new(MemoryStore::new());
        let bindings = ClientBindings::new(store.clone(), "sid-1");

        bindings.bind("chat", 1, 3).await.unwrap();
        bindings.bind("chat", 2, 3).await.unwrap();
        assert!(bindings.is_online("chat", 3).await.unwrap());
        assert!(!bindings.is_online("example", 3).await.unwrap());
        assert!(!bindings.is_online_on("sid-2", "chat", 3).await.unwrap());

        bindings.unbind("chat", 1).await.unwrap();
        assert!(bindings.is_online("chat", 3).await.unwrap());
        bindings.unbind("chat", 2).await.unwrap();
        assert!(!bindings.is_online("chat", 3).await.unwrap());

        // unknown cid is a no-op
        bindings.unbind("chat", 99).await.unwrap();
    }
}
