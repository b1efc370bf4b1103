//! Channel handlers

use std::sync::Arc;

use bytes::Bytes;
use lumen_gateway::fanout::EVENT_KEYBOARD;
use lumen_gateway::protocol::{self, Envelope};
use lumen_gateway::{Client, ClientHandler, MessageService, NewMessage, OutboundMessage, TalkType};
use serde::Deserialize;
use tracing::{debug, info, warn};

/// 客户端发送消息事件
pub const EVENT_PUBLISH: &str = "im.message.publish";

#[derive(Debug, Deserialize)]
struct Receiver {
    talk_type: TalkType,
    receiver_id: i64,
}

#[derive(Debug, Deserialize)]
struct PublishContent {
    receiver: Receiver,
    #[serde(default)]
    body: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct KeyboardContent {
    receiver_id: i64,
}

/// Dispatcher for the `chat` channel.
pub struct ChatHandler {
    service: MessageService,
}

impl ChatHandler {
    pub fn new(service: MessageService) -> Self {
        Self { service }
    }

    fn keyboard(&self, client: &Arc<Client>, envelope: Envelope) {
        let content: KeyboardContent = match serde_json::from_value(envelope.content) {
            Ok(content) => content,
            Err(e) => {
                debug!(cid = client.cid(), "Bad keyboard frame: {}", e);
                return;
            }
        };

        let service = self.service.clone();
        let sender_id = client.uid();
        tokio::spawn(async move {
            service.keyboard(sender_id, content.receiver_id).await;
        });
    }

    fn publish(&self, client: &Arc<Client>, envelope: Envelope) {
        let content: PublishContent = match serde_json::from_value(envelope.content) {
            Ok(content) => content,
            Err(e) => {
                debug!(cid = client.cid(), "Bad publish frame: {}", e);
                reply_error(client, "invalid message");
                return;
            }
        };

        let message = NewMessage {
            sender_id: client.uid(),
            talk_type: content.receiver.talk_type,
            receiver_id: content.receiver.receiver_id,
            body: content.body,
        };
        let service = self.service.clone();
        let client = Arc::clone(client);
        tokio::spawn(async move {
            if let Err(e) = service.send(message).await {
                warn!(cid = client.cid(), uid = client.uid(), "Message send failed: {}", e);
                reply_error(&client, "message not sent");
            }
        });
    }
}

impl ClientHandler for ChatHandler {
    fn on_open(&self, client: &Arc<Client>) {
        info!(cid = client.cid(), uid = client.uid(), "Chat client connected");
    }

    fn on_message(&self, client: &Arc<Client>, event: &str, frame: Bytes) {
        let envelope = match Envelope::from_slice(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(cid = client.cid(), "Undecodable frame: {}", e);
                return;
            }
        };

        match event {
            EVENT_KEYBOARD => self.keyboard(client, envelope),
            EVENT_PUBLISH => self.publish(client, envelope),
            other => debug!(cid = client.cid(), event = other, "Unhandled chat event"),
        }
    }

    fn on_close(&self, client: &Client, code: u16, reason: &str) {
        info!(cid = client.cid(), uid = client.uid(), code, reason, "Chat client disconnected");
    }
}

fn reply_error(client: &Client, message: &str) {
    if let Err(e) = client.try_write(OutboundMessage::new(protocol::error_frame(message))) {
        debug!(cid = client.cid(), "Error reply not queued: {}", e);
    }
}

/// `example` 渠道：原样回显
#[derive(Debug, Default)]
pub struct EchoHandler;

impl ClientHandler for EchoHandler {
    fn on_message(&self, client: &Arc<Client>, _event: &str, frame: Bytes) {
        if let Err(e) = client.try_write(OutboundMessage::new(frame)) {
            debug!(cid = client.cid(), "Echo not queued: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_content_shape() {
        let frame = serde_json::json!({
            "event": EVENT_PUBLISH,
            "content": {
                "receiver": {"talk_type": 2, "receiver_id": 100},
                "body": {"text": "hi"}
            }
        });
        let envelope: Envelope = serde_json::from_value(frame).unwrap();
        let content: PublishContent = serde_json::from_value(envelope.content).unwrap();
        assert_eq!(content.receiver.talk_type, TalkType::Group);
        assert_eq!(content.receiver.receiver_id, 100);
        assert_eq!(content.body["text"], "hi");
    }

    #[test]
    fn test_publish_rejects_unknown_talk_type() {
        let content = serde_json::json!({"receiver": {"talk_type": 9, "receiver_id": 1}});
        assert!(serde_json::from_value::<PublishContent>(content).is_err());
    }
}
