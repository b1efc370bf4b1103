//! Wire protocol
//!
//! Every frame is a JSON envelope `{"event": ..., "content": ..., "ack_id"?: ...}`.
//! Inbound frames may carry `data` in place of `content`.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// 客户端心跳事件
pub const EVENT_HEARTBEAT: &str = "heartbeat";
/// 连接建立后下发的配置事件
pub const EVENT_CONNECT: &str = "connect";
/// 客户端确认事件
pub const EVENT_ACK: &str = "ack";
/// 错误通知
pub const EVENT_ERROR: &str = "error";

/// Close codes reported to lifecycle callbacks.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const ABNORMAL: u16 = 1006;
    pub const HEARTBEAT_TIMEOUT: u16 = 2000;
}

/// Message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default, alias = "data")]
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<String>,
}

impl Envelope {
    pub fn new(event: impl Into<String>, content: impl Serialize) -> serde_json::Result<Self> {
        Ok(Self {
            event: event.into(),
            content: serde_json::to_value(content)?,
            ack_id: None,
        })
    }

    pub fn with_ack_id(mut self, ack_id: impl Into<String>) -> Self {
        self.ack_id = Some(ack_id.into());
        self
    }

    pub fn to_bytes(&self) -> serde_json::Result<Bytes> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn from_slice(frame: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(frame)
    }
}

/// `{"event":"connect","content":{"ping_interval":I,"ping_timeout":T}}`
///
/// Both values are whole seconds, rounded up so a sub-second setting never
/// reaches the client as 0.
pub fn connect_frame(ping_interval: Duration, ping_timeout: Duration) -> Bytes {
    let frame = json!({
        "event": EVENT_CONNECT,
        "content": {
            "ping_interval": ceil_secs(ping_interval),
            "ping_timeout": ceil_secs(ping_timeout),
        },
    });
    Bytes::from(frame.to_string())
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

/// `{"event":"heartbeat","content":"pong"}`
pub fn pong_frame() -> Bytes {
    Bytes::from_static(br#"{"event":"heartbeat","content":"pong"}"#)
}

/// `{"event":"ack","content":{"ack_id":"..."}}`
pub fn ack_frame(ack_id: &str) -> Bytes {
    Bytes::from(json!({ "event": EVENT_ACK, "content": { "ack_id": ack_id } }).to_string())
}

/// `{"event":"error","content":"..."}`
pub fn error_frame(message: &str) -> Bytes {
    Bytes::from(json!({ "event": EVENT_ERROR, "content": message }).to_string())
}

#[derive(Deserialize)]
struct EventOnly {
    event: String,
}

/// Extracts the `event` field without materializing the rest of the frame.
pub fn peek_event(frame: &[u8]) -> Option<String> {
    serde_json::from_slice::<EventOnly>(frame)
        .ok()
        .map(|e| e.event)
        .filter(|e| !e.is_empty())
}

#[derive(Deserialize)]
struct AckContent {
    ack_id: String,
}

#[derive(Deserialize)]
struct AckFrame {
    #[serde(default, alias = "data")]
    content: Option<AckContent>,
    #[serde(default)]
    ack_id: Option<String>,
}

/// Reads the acknowledged id from an `ack` frame.
pub fn parse_ack_id(frame: &[u8]) -> Option<String> {
    let frame: AckFrame = serde_json::from_slice(frame).ok()?;
    frame
        .content
        .map(|c| c.ack_id)
        .or(frame.ack_id)
        .filter(|id| !id.is_empty())
}

/// First frame on a raw TCP connection.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthFrame {
    pub token: String,
    #[serde(default)]
    pub channel: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peek_event() {
        assert_eq!(
            peek_event(br#"{"event":"heartbeat","content":"ping"}"#).as_deref(),
            Some("heartbeat")
        );
        assert_eq!(
            peek_event(br#"{"content":{"big":[1,2,3]},"event":"im.message.publish"}"#).as_deref(),
            Some("im.message.publish")
        );
        assert_eq!(peek_event(br#"{"content":1}"#), None);
        assert_eq!(peek_event(br#"{"event":""}"#), None);
        assert_eq!(peek_event(b"not json"), None);
    }

    #[test]
    fn test_parse_ack_id_variants() {
        assert_eq!(
            parse_ack_id(br#"{"event":"ack","content":{"ack_id":"a-1"}}"#).as_deref(),
            Some("a-1")
        );
        assert_eq!(
            parse_ack_id(br#"{"event":"ack","data":{"ack_id":"a-2"}}"#).as_deref(),
            Some("a-2")
        );
        assert_eq!(
            parse_ack_id(br#"{"event":"ack","ack_id":"a-3"}"#).as_deref(),
            Some("a-3")
        );
        assert_eq!(parse_ack_id(br#"{"event":"ack","content":{}}"#), None);
    }

    #[test]
    fn test_envelope_accepts_data_alias() {
        let env = Envelope::from_slice(br#"{"event":"x","data":{"k":1}}"#).unwrap();
        assert_eq!(env.content["k"], 1);
        assert!(env.ack_id.is_none());

        let out = Envelope::new("im.message", json!({"record_id": 5}))
            .unwrap()
            .with_ack_id("abc");
        let text = String::from_utf8(out.to_bytes().unwrap().to_vec()).unwrap();
        assert!(text.contains(r#""ack_id":"abc""#));
        assert!(text.contains(r#""content":{"record_id":5}"#));
    }

    #[test]
    fn test_control_frames() {
        let connect: serde_json::Value = serde_json::from_slice(&connect_frame(
            Duration::from_secs(30),
            Duration::from_secs(75),
        ))
        .unwrap();
        assert_eq!(connect["event"], "connect");
        assert_eq!(connect["content"]["ping_interval"], 30);
        assert_eq!(connect["content"]["ping_timeout"], 75);

        let short: serde_json::Value = serde_json::from_slice(&connect_frame(
            Duration::from_millis(1500),
            Duration::from_millis(200),
        ))
        .unwrap();
        assert_eq!(short["content"]["ping_interval"], 2);
        assert_eq!(short["content"]["ping_timeout"], 1);

        let pong: serde_json::Value = serde_json::from_slice(&pong_frame()).unwrap();
        assert_eq!(pong["content"], "pong");

        assert_eq!(parse_ack_id(&ack_frame("z")).as_deref(), Some("z"));
    }
}
