//! Message creation
//!
//! Allocates a sequence, persists through the [`MessageRepository`], then
//! fans the delivery event out. Sequence and persistence errors reach the
//! caller; fanout never does.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::GatewayResult;
use crate::fanout::{FanoutReport, FanoutRouter, KeyboardEvent, TalkEvent, TalkType};
use crate::sequence::{SequenceGenerator, SequenceSeed};

/// A message about to be created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub sender_id: i64,
    pub talk_type: TalkType,
    pub receiver_id: i64,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl NewMessage {
    /// Sequence counter operands: the user pair, or `(0, group_id)`.
    pub fn conversation(&self) -> (i64, i64) {
        match self.talk_type {
            TalkType::Private => (self.sender_id, self.receiver_id),
            TalkType::Group => (0, self.receiver_id),
        }
    }
}

/// 已持久化的消息记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub record_id: i64,
    pub sender_id: i64,
    pub talk_type: TalkType,
    pub receiver_id: i64,
    pub sequence: i64,
    pub body: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn talk_event(&self) -> TalkEvent {
        TalkEvent {
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            talk_type: self.talk_type,
            record_id: self.record_id,
            sequence: self.sequence,
        }
    }
}

/// Durable message storage.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn save(&self, message: &NewMessage, sequence: i64) -> GatewayResult<MessageRecord>;
}

/// In-process repository. Bodies are handed back to the caller and not
/// retained; only the highest sequence per conversation is remembered, which
/// is what reseeding an expired counter needs. Ids start at 1.
#[derive(Debug, Default)]
pub struct MemoryMessageRepository {
    next_id: AtomicI64,
    latest: DashMap<String, i64>,
}

impl MemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records saved so far.
    pub fn saved(&self) -> i64 {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Highest sequence saved for the conversation of `a` and `b`, 0 if none.
    pub fn latest_sequence(&self, a: i64, b: i64) -> i64 {
        self.latest
            .get(&SequenceGenerator::name(a, b))
            .map_or(0, |v| *v)
    }
}

#[async_trait]
impl SequenceSeed for MemoryMessageRepository {
    async fn current(&self, a: i64, b: i64) -> GatewayResult<i64> {
        Ok(self.latest_sequence(a, b))
    }
}

#[async_trait]
impl MessageRepository for MemoryMessageRepository {
    async fn save(&self, message: &NewMessage, sequence: i64) -> GatewayResult<MessageRecord> {
        let record = MessageRecord {
            record_id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            sender_id: message.sender_id,
            talk_type: message.talk_type,
            receiver_id: message.receiver_id,
            sequence,
            body: message.body.clone(),
            created_at: Utc::now(),
        };
        let (a, b) = message.conversation();
        self.latest
            .entry(SequenceGenerator::name(a, b))
            .and_modify(|v| *v = (*v).max(sequence))
            .or_insert(sequence);
        Ok(record)
    }
}

#[derive(Clone)]
pub struct MessageService {
    sequences: SequenceGenerator,
    repository: Arc<dyn MessageRepository>,
    router: Arc<FanoutRouter>,
}

impl std::fmt::Debug for MessageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageService")
            .field("sequences", &self.sequences)
            .field("router", &self.router)
            .finish()
    }
}

impl MessageService {
    pub fn new(
        sequences: SequenceGenerator,
        repository: Arc<dyn MessageRepository>,
        router: Arc<FanoutRouter>,
    ) -> Self {
        Self {
            sequences,
            repository,
            router,
        }
    }

    /// 发送消息
    pub async fn send(&self, message: NewMessage) -> GatewayResult<MessageRecord> {
        let (a, b) = message.conversation();
        let sequence = self.sequences.get(a, b).await?;
        let record = self.repository.save(&message, sequence).await?;

        let report = self.router.publish(&record.talk_event()).await;
        debug!(
            record_id = record.record_id,
            sequence,
            published = report.published,
            "Message sent"
        );
        Ok(record)
    }

    /// Creates one record per body in the same conversation, with contiguous
    /// sequences allocated in a single round trip.
    pub async fn forward(
        &self,
        sender_id: i64,
        talk_type: TalkType,
        receiver_id: i64,
        bodies: Vec<serde_json::Value>,
    ) -> GatewayResult<Vec<MessageRecord>> {
        let template = NewMessage {
            sender_id,
            talk_type,
            receiver_id,
            body: serde_json::Value::Null,
        };
        let (a, b) = template.conversation();
        let count = u32::try_from(bodies.len()).unwrap_or(u32::MAX);
        let sequences = self.sequences.batch_get(a, b, count).await?;

        let mut records = Vec::with_capacity(bodies.len());
        for (body, sequence) in bodies.into_iter().zip(sequences) {
            let message = NewMessage {
                body,
                ..template.clone()
            };
            records.push(self.repository.save(&message, sequence).await?);
        }

        for record in &records {
            self.router.publish(&record.talk_event()).await;
        }
        Ok(records)
    }

    /// Broadcasts a typing indicator.
    pub async fn keyboard(&self, sender_id: i64, receiver_id: i64) -> FanoutReport {
        self.router
            .publish_keyboard(&KeyboardEvent {
                sender_id,
                receiver_id,
            })
            .await
    }
}
