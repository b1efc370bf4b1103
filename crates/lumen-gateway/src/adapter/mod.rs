//! Connection adapters
//!
//! WebSocket and raw TCP are exposed through the same [`Connection`] contract so
//! the client lifecycle never needs to know which transport it is running on.

mod tcp;
mod websocket;

pub use tcp::{frame_codec, TcpConnection};
pub use websocket::WebSocketConnection;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::AdapterError;

pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Invoked with the peer's close code and reason.
pub type CloseHandler = Arc<dyn Fn(u16, String) + Send + Sync>;

#[async_trait]
pub trait Connection: Send + Sync {
    /// "websocket" or "tcp"
    fn network(&self) -> &'static str;

    /// Next logical frame. Fails once the peer is gone or `close` was called.
    async fn read(&self) -> AdapterResult<Bytes>;

    async fn write(&self, frame: &[u8]) -> AdapterResult<()>;

    async fn close(&self) -> AdapterResult<()>;

    fn set_close_handler(&self, handler: CloseHandler);
}

/// Holder for the close handler shared by both adapters.
#[derive(Default)]
pub(crate) struct CloseHook {
    handler: Mutex<Option<CloseHandler>>,
}

impl CloseHook {
    pub(crate) fn set(&self, handler: CloseHandler) {
        *self.handler.lock() = Some(handler);
    }

    pub(crate) fn fire(&self, code: u16, reason: impl Into<String>) {
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler(code, reason.into());
        }
    }
}
