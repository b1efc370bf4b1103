//! Channel registry
//!
//! A channel is a named group of clients sharing the same handler, e.g.
//! `chat` or `example`. [`Channels`] maps names to channels.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use crate::client::{Client, ClientId};
use crate::queue::OutboundMessage;

/// Outcome of a broadcast.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// 单个渠道内的客户端集合
pub struct Channel {
    name: String,
    clients: DashMap<ClientId, Arc<Client>>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("clients", &self.clients.len())
            .finish()
    }
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            clients: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add(&self, client: Arc<Client>) {
        self.clients.insert(client.cid(), client);
    }

    /// Removes a client. Removing an unknown cid is a no-op.
    pub fn remove(&self, cid: ClientId) -> Option<Arc<Client>> {
        self.clients.remove(&cid).map(|(_, client)| client)
    }

    pub fn get(&self, cid: ClientId) -> Option<Arc<Client>> {
        self.clients.get(&cid).map(|entry| Arc::clone(entry.value()))
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// 获取某个用户在本渠道的全部连接
    pub fn clients_of(&self, uid: i64) -> Vec<Arc<Client>> {
        self.clients
            .iter()
            .filter(|entry| entry.value().uid() == uid)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Point-in-time copy of every client; no shard lock survives the call.
    pub fn snapshot(&self) -> Vec<Arc<Client>> {
        self.clients
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Writes `message` to every client. A failing client does not stop the rest.
    pub async fn broadcast(&self, message: OutboundMessage) -> BroadcastReport {
        deliver(self.snapshot(), message).await
    }

    /// Writes `message` to every connection of `uid`, returning how many accepted it.
    pub async fn send_to_user(&self, uid: i64, message: OutboundMessage) -> usize {
        deliver(self.clients_of(uid), message).await.delivered
    }
}

async fn deliver(clients: Vec<Arc<Client>>, message: OutboundMessage) -> BroadcastReport {
    let mut report = BroadcastReport::default();
    for client in clients {
        match client.write(message.clone()).await {
            Ok(_) => report.delivered += 1,
            Err(e) => {
                trace!(cid = client.cid(), "Broadcast skipped client: {}", e);
                report.failed += 1;
            }
        }
    }
    report
}

/// 渠道名到渠道的映射
#[derive(Debug, Default)]
pub struct Channels {
    channels: DashMap<String, Arc<Channel>>,
}

impl Channels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, name: &str) -> Arc<Channel> {
        if let Some(channel) = self.channels.get(name) {
            return Arc::clone(channel.value());
        }
        let channel = self
            .channels
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Channel::new(name)));
        Arc::clone(channel.value())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn total_clients(&self) -> usize {
        self.channels.iter().map(|e| e.value().count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_returns_same_channel() {
        let channels = Channels::new();
        let a = channels.get_or_create("chat");
        let b = channels.get_or_create("chat");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "chat");

        channels.get_or_create("example");
        assert_eq!(channels.names(), vec!["chat".to_string(), "example".to_string()]);
        assert!(channels.get("missing").is_none());
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let channel = Channel::new("chat");
        assert!(channel.remove(42).is_none());
        assert_eq!(channel.count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_empty_channel() {
        let channel = Channel::new("chat");
        let report = channel.broadcast(OutboundMessage::new("x")).await;
        assert_eq!(report, BroadcastReport::default());
        assert_eq!(channel.send_to_user(1, OutboundMessage::new("x")).await, 0);
    }
}
