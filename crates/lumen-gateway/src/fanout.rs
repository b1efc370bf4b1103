//! Cross-process fanout
//!
//! Decides which pub/sub topics a freshly persisted message goes to. Small
//! clusters and group messages use the global topic; private messages in
//! larger clusters go only to the processes hosting either participant.

use std::collections::BTreeSet;
use std::sync::Arc;

use lumen_observability::FanoutMetrics;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::presence::{ClientBindings, ServerRegistry};
use crate::protocol::Envelope;
use crate::store::KvStore;

/// 对话消息事件
pub const EVENT_TALK: &str = "im.message";
/// 键盘输入事件
pub const EVENT_KEYBOARD: &str = "im.message.keyboard";

/// Topic every gateway process subscribes to.
pub const GLOBAL_TOPIC: &str = "im:message:chat:all";
/// Channel whose bindings decide targeted fanout.
pub const CHAT_CHANNEL: &str = "chat";

/// Topic of a single gateway process.
pub fn server_topic(sid: &str) -> String {
    format!("im:message:chat:{}", sid)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TalkType {
    Private = 1,
    Group = 2,
}

impl TryFrom<u8> for TalkType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(TalkType::Private),
            2 => Ok(TalkType::Group),
            other => Err(format!("unknown talk type {}", other)),
        }
    }
}

impl From<TalkType> for u8 {
    fn from(value: TalkType) -> Self {
        value as u8
    }
}

/// Payload of an `im.message` delivery event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TalkEvent {
    pub sender_id: i64,
    pub receiver_id: i64,
    pub talk_type: TalkType,
    pub record_id: i64,
    #[serde(default)]
    pub sequence: i64,
}

/// Payload of an `im.message.keyboard` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyboardEvent {
    pub sender_id: i64,
    pub receiver_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FanoutPlan {
    Global,
    /// Each process at most once.
    Targeted(BTreeSet<String>),
}

impl FanoutPlan {
    pub fn topics(&self) -> Vec<String> {
        match self {
            FanoutPlan::Global => vec![GLOBAL_TOPIC.to_string()],
            FanoutPlan::Targeted(sids) => sids.iter().map(|sid| server_topic(sid)).collect(),
        }
    }
}

/// Outcome of one publish. Failures are already logged and counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutReport {
    pub plan: FanoutPlan,
    pub published: usize,
    pub failed: usize,
}

pub struct FanoutRouter {
    store: Arc<dyn KvStore>,
    registry: ServerRegistry,
    bindings: ClientBindings,
    threshold: usize,
}

impl std::fmt::Debug for FanoutRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutRouter")
            .field("registry", &self.registry)
            .field("threshold", &self.threshold)
            .finish()
    }
}

impl FanoutRouter {
    pub fn new(
        store: Arc<dyn KvStore>,
        registry: ServerRegistry,
        bindings: ClientBindings,
        threshold: usize,
    ) -> Self {
        Self {
            store,
            registry,
            bindings,
            threshold,
        }
    }

    pub async fn plan(&self, event: &TalkEvent) -> FanoutPlan {
        if event.talk_type == TalkType::Group {
            return FanoutPlan::Global;
        }

        let live = match self.registry.live().await {
            Ok(live) => live,
            Err(e) => {
                warn!("Live server lookup failed, using global topic: {}", e);
                return FanoutPlan::Global;
            }
        };

        // 小于等于阈值的集群直接全局广播
        if live.len() <= self.threshold {
            return FanoutPlan::Global;
        }

        let mut targets = BTreeSet::new();
        for sid in live {
            for uid in [event.sender_id, event.receiver_id] {
                match self.bindings.is_online_on(&sid, CHAT_CHANNEL, uid).await {
                    Ok(false) => continue,
                    Ok(true) => {}
                    Err(e) => {
                        debug!(sid = %sid, uid, "Binding lookup failed, including server: {}", e);
                    }
                }
                targets.insert(sid.clone());
                break;
            }
        }
        FanoutPlan::Targeted(targets)
    }

    /// Publishes a delivery event. Never fails; see the returned report.
    pub async fn publish(&self, event: &TalkEvent) -> FanoutReport {
        let plan = self.plan(event).await;
        let (published, failed) = match encode(EVENT_TALK, event) {
            Some(payload) => self.send(&plan, &payload).await,
            None => (0, plan.topics().len()),
        };

        match &plan {
            FanoutPlan::Global => FanoutMetrics::record_global(),
            FanoutPlan::Targeted(sids) => FanoutMetrics::record_targeted(sids.len()),
        }
        debug!(
            record_id = event.record_id,
            ?plan,
            published,
            failed,
            "Message fanout"
        );

        FanoutReport {
            plan,
            published,
            failed,
        }
    }

    /// Keyboard events always go to the global topic.
    pub async fn publish_keyboard(&self, event: &KeyboardEvent) -> FanoutReport {
        let plan = FanoutPlan::Global;
        let (published, failed) = match encode(EVENT_KEYBOARD, event) {
            Some(payload) => self.send(&plan, &payload).await,
            None => (0, 1),
        };
        FanoutReport {
            plan,
            published,
            failed,
        }
    }

    async fn send(&self, plan: &FanoutPlan, payload: &str) -> (usize, usize) {
        let kind = match plan {
            FanoutPlan::Global => "global",
            FanoutPlan::Targeted(_) => "server",
        };

        let mut published = 0;
        let mut failed = 0;
        for topic in plan.topics() {
            match self.store.publish(&topic, payload).await {
                Ok(()) => published += 1,
                Err(e) => {
                    warn!(topic = %topic, "Publish failed: {}", e);
                    FanoutMetrics::record_failure(kind);
                    failed += 1;
                }
            }
        }
        (published, failed)
    }
}

fn encode(event: &str, content: impl Serialize) -> Option<String> {
    let encoded = Envelope::new(event, content)
        .and_then(|envelope| serde_json::to_string(&envelope));
    match encoded {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!(event, "Failed to encode delivery event: {}", e);
            None
        }
    }
}
