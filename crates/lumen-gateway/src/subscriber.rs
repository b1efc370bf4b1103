//! Fanout subscriber
//!
//! Listens on the global topic and this process's own topic, and pushes
//! delivery events to the local clients of the recipients in channel `chat`.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use lumen_observability::logging::message_span;
use lumen_observability::FanoutMetrics;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument};

use crate::channel::Channels;
use crate::error::{GatewayError, GatewayResult};
use crate::fanout::{
    server_topic, KeyboardEvent, TalkEvent, TalkType, CHAT_CHANNEL, EVENT_KEYBOARD, EVENT_TALK,
    GLOBAL_TOPIC,
};
use crate::protocol::Envelope;
use crate::queue::OutboundMessage;
use crate::store::KvStore;

/// 群成员查询
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    async fn members(&self, group_id: i64) -> GatewayResult<Vec<i64>>;
}

/// Group members kept as a set at `im:group:members:{gid}`.
pub struct StoreGroupDirectory {
    store: Arc<dyn KvStore>,
}

impl StoreGroupDirectory {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn key(group_id: i64) -> String {
        format!("im:group:members:{}", group_id)
    }
}

#[async_trait]
impl GroupDirectory for StoreGroupDirectory {
    async fn members(&self, group_id: i64) -> GatewayResult<Vec<i64>> {
        let members = self.store.smembers(&Self::key(group_id)).await?;
        Ok(members
            .into_iter()
            .filter_map(|uid| uid.parse::<i64>().ok())
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct MemoryGroupDirectory {
    groups: DashMap<i64, Vec<i64>>,
}

impl MemoryGroupDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_members(&self, group_id: i64, members: Vec<i64>) {
        self.groups.insert(group_id, members);
    }
}

#[async_trait]
impl GroupDirectory for MemoryGroupDirectory {
    async fn members(&self, group_id: i64) -> GatewayResult<Vec<i64>> {
        self.groups
            .get(&group_id)
            .map(|members| members.value().clone())
            .ok_or_else(|| GatewayError::GroupLookup(format!("unknown group {}", group_id)))
    }
}

pub struct FanoutSubscriber {
    store: Arc<dyn KvStore>,
    sid: String,
    channels: Arc<Channels>,
    groups: Arc<dyn GroupDirectory>,
    deliver_with_ack: bool,
}

impl FanoutSubscriber {
    pub fn new(
        store: Arc<dyn KvStore>,
        sid: impl Into<String>,
        channels: Arc<Channels>,
        groups: Arc<dyn GroupDirectory>,
        deliver_with_ack: bool,
    ) -> Self {
        Self {
            store,
            sid: sid.into(),
            channels,
            groups,
            deliver_with_ack,
        }
    }

    pub fn topics(&self) -> Vec<String> {
        vec![GLOBAL_TOPIC.to_string(), server_topic(&self.sid)]
    }

    /// Consumes both topics until cancelled or the subscription ends.
    pub async fn run(self, cancel: CancellationToken) -> GatewayResult<()> {
        let topics = self.topics();
        let mut rx = self.store.subscribe(&topics).await?;
        info!(?topics, "Fanout subscriber started");

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = rx.recv() => message,
            };
            let Some(message) = message else {
                warn!("Fanout subscription closed");
                break;
            };
            trace!(topic = %message.topic, "Fanout message received");
            self.dispatch(&message.payload).await;
        }

        info!("Fanout subscriber stopped");
        Ok(())
    }

    /// Delivers one pub/sub payload; returns how many client queues accepted it.
    pub async fn dispatch(&self, payload: &str) -> usize {
        let envelope = match serde_json::from_str::<Envelope>(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Dropping malformed fanout payload: {}", e);
                return 0;
            }
        };

        let delivered = match envelope.event.as_str() {
            EVENT_TALK => {
                let Some(event) = decode_content::<TalkEvent>(&envelope.content) else {
                    return 0;
                };
                let span = message_span(EVENT_TALK, Some(event.record_id));
                self.deliver_talk(event).instrument(span).await
            }
            EVENT_KEYBOARD => {
                let Some(event) = decode_content::<KeyboardEvent>(&envelope.content) else {
                    return 0;
                };
                self.deliver(&[event.receiver_id], EVENT_KEYBOARD, &event, false)
                    .await
            }
            other => {
                debug!(event = other, "Ignoring unknown fanout event");
                0
            }
        };

        FanoutMetrics::record_delivered(delivered);
        delivered
    }

    async fn deliver_talk(&self, event: TalkEvent) -> usize {
        let recipients = match event.talk_type {
            TalkType::Private if event.sender_id == event.receiver_id => vec![event.sender_id],
            TalkType::Private => vec![event.sender_id, event.receiver_id],
            TalkType::Group => match self.groups.members(event.receiver_id).await {
                Ok(members) => members,
                Err(e) => {
                    warn!(group_id = event.receiver_id, "Group member lookup failed: {}", e);
                    return 0;
                }
            },
        };
        self.deliver(&recipients, EVENT_TALK, &event, self.deliver_with_ack)
            .await
    }

    async fn deliver(
        &self,
        recipients: &[i64],
        event: &str,
        content: &impl serde::Serialize,
        with_ack: bool,
    ) -> usize {
        let Some(channel) = self.channels.get(CHAT_CHANNEL) else {
            return 0;
        };
        let envelope = match Envelope::new(event, content) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(event, "Failed to encode delivery frame: {}", e);
                return 0;
            }
        };

        let mut delivered = 0;
        for &uid in recipients {
            for client in channel.clients_of(uid) {
                let message = match outbound(&envelope, with_ack) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(event, "Failed to encode delivery frame: {}", e);
                        return delivered;
                    }
                };
                match client.write(message).await {
                    Ok(_) => delivered += 1,
                    Err(e) => trace!(cid = client.cid(), "Delivery skipped: {}", e),
                }
            }
        }
        delivered
    }
}

/// One frame per client so every ack-required copy gets its own ack id.
fn outbound(envelope: &Envelope, with_ack: bool) -> serde_json::Result<OutboundMessage> {
    if !with_ack {
        return Ok(OutboundMessage::new(envelope.to_bytes()?));
    }
    let ack_id = uuid::Uuid::new_v4().to_string();
    let frame = envelope.clone().with_ack_id(ack_id.clone()).to_bytes()?;
    Ok(OutboundMessage::with_ack(ack_id, frame))
}

/// Content may arrive as an object or as a JSON-encoded string.
fn decode_content<T: DeserializeOwned>(content: &serde_json::Value) -> Option<T> {
    let decoded = match content {
        serde_json::Value::String(raw) => serde_json::from_str(raw),
        value => serde_json::from_value(value.clone()),
    };
    match decoded {
        Ok(event) => Some(event),
        Err(e) => {
            debug!("Dropping fanout event with bad content: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_decode_content_accepts_object_and_string() {
        let object = serde_json::json!({"sender_id": 1, "receiver_id": 2});
        let string = serde_json::Value::String(object.to_string());

        let a: KeyboardEvent = decode_content(&object).unwrap();
        let b: KeyboardEvent = decode_content(&string).unwrap();
        assert_eq!(a, b);
        assert!(decode_content::<KeyboardEvent>(&serde_json::json!(42)).is_none());
    }

    #[test]
    fn test_outbound_ack_ids_are_unique() {
        let envelope = Envelope::new(EVENT_TALK, serde_json::json!({})).unwrap();
        let a = outbound(&envelope, true).unwrap();
        let b = outbound(&envelope, true).unwrap();
        assert!(a.ack_required);
        assert_ne!(a.ack_id, b.ack_id);

        let frame: Envelope = serde_json::from_slice(&a.payload).unwrap();
        assert_eq!(frame.ack_id.as_deref(), Some(a.ack_id.as_str()));
        assert!(!outbound(&envelope, false).unwrap().ack_required);
    }

    #[tokio::test]
    async fn test_store_group_directory() {
        let store = Arc::new(MemoryStore::new());
        store.sadd(&StoreGroupDirectory::key(5), "3").await.unwrap();
        store.sadd(&StoreGroupDirectory::key(5), "9").await.unwrap();

        let directory = StoreGroupDirectory::new(store);
        let mut members = directory.members(5).await.unwrap();
        members.sort();
        assert_eq!(members, vec![3, 9]);
        assert!(directory.members(6).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_without_chat_channel_delivers_nothing() {
        let store = Arc::new(MemoryStore::new());
        let subscriber = FanoutSubscriber::new(
            store,
            "sid-1",
            Arc::new(Channels::new()),
            Arc::new(MemoryGroupDirectory::new()),
            true,
        );
        let payload = r#"{"event":"im.message.keyboard","content":{"sender_id":1,"receiver_id":2}}"#;
        assert_eq!(subscriber.dispatch(payload).await, 0);
        assert_eq!(subscriber.dispatch("not json").await, 0);
    }
}
