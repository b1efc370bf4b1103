//! Heartbeat monitor
//!
//! Periodically closes clients that have been silent for longer than the
//! heartbeat timeout. Any inbound frame counts as a heartbeat.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use lumen_observability::ConnectionMetrics;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::{now_millis, Client, ClientId};
use crate::protocol::close_code;

pub struct HealthMonitor {
    clients: DashMap<ClientId, Arc<Client>>,
    timeout: Duration,
    interval: Duration,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("clients", &self.clients.len())
            .field("timeout", &self.timeout)
            .field("interval", &self.interval)
            .finish()
    }
}

impl HealthMonitor {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            timeout,
            interval,
        }
    }

    pub fn insert(&self, client: Arc<Client>) {
        self.clients.insert(client.cid(), client);
    }

    pub fn remove(&self, cid: ClientId) {
        self.clients.remove(&cid);
    }

    pub fn contains(&self, cid: ClientId) -> bool {
        self.clients.contains_key(&cid)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// 检查一轮心跳，关闭超时的客户端，返回关闭数量
    pub async fn sweep(&self, now_ms: i64) -> usize {
        let timeout_ms = i64::try_from(self.timeout.as_millis()).unwrap_or(i64::MAX);

        // collect first: closing removes from the map
        let expired: Vec<Arc<Client>> = self
            .clients
            .iter()
            .filter(|entry| now_ms - entry.value().last_heartbeat() > timeout_ms)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut closed = 0;
        for client in expired {
            debug!(
                cid = client.cid(),
                uid = client.uid(),
                idle_ms = now_ms - client.last_heartbeat(),
                "Heartbeat timeout"
            );
            if client.close(close_code::HEARTBEAT_TIMEOUT, "heartbeat timeout").await {
                ConnectionMetrics::record_heartbeat_timeout();
                closed += 1;
            }
            self.remove(client.cid());
        }
        closed
    }

    /// Runs the sweep every `interval` until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            timeout_ms = self.timeout.as_millis() as u64,
            "Heartbeat monitor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let closed = self.sweep(now_millis()).await;
                    if closed > 0 {
                        debug!(closed, "Heartbeat sweep closed clients");
                    }
                }
            }
        }

        info!("Heartbeat monitor stopped");
    }
}
