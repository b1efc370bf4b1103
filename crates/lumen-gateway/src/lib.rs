//! Lumen gateway core
//!
//! Persistent client connections over WebSocket or length-prefixed TCP,
//! heartbeat supervision, ack-based redelivery, per-conversation sequence
//! numbers and cross-process message fanout.

pub mod ack;
pub mod adapter;
pub mod channel;
pub mod client;
pub mod error;
pub mod fanout;
pub mod gateway;
pub mod handler;
pub mod health;
pub mod hub;
pub mod presence;
pub mod protocol;
pub mod queue;
pub mod sequence;
pub mod service;
pub mod store;
pub mod subscriber;

pub use ack::{AckBuffer, AckEntry, AckSweep};
pub use adapter::{Connection, TcpConnection, WebSocketConnection};
pub use channel::{BroadcastReport, Channel, Channels};
pub use client::{Client, ClientId, ClientState};
pub use error::{AdapterError, GatewayError, GatewayResult, QueueError, StoreError, StoreResult};
pub use fanout::{FanoutPlan, FanoutReport, FanoutRouter, KeyboardEvent, TalkEvent, TalkType};
pub use gateway::{Authenticator, Gateway, GatewayConfig};
pub use handler::{ClientHandler, NoopHandler};
pub use health::HealthMonitor;
pub use hub::{Hub, HubSettings};
pub use presence::{ClientBindings, ClientStorage, PresenceReporter, ServerRegistry, ServerStatus};
pub use protocol::Envelope;
pub use queue::{OutboundMessage, OutboundQueue, PushOutcome};
pub use sequence::{SequenceGenerator, SequenceSeed};
pub use service::{MemoryMessageRepository, MessageRecord, MessageRepository, MessageService, NewMessage};
pub use store::{KvStore, MemoryStore, RedisStore, TopicMessage};
pub use subscriber::{FanoutSubscriber, GroupDirectory, MemoryGroupDirectory, StoreGroupDirectory};
