//! Client lifecycle callbacks

use std::sync::Arc;

use bytes::Bytes;

use crate::client::Client;

/// Lifecycle callbacks for the clients of one channel.
///
/// Every method defaults to a no-op. Callbacks run inline on the client's
/// tasks, so anything slow should be spawned.
pub trait ClientHandler: Send + Sync {
    /// The client has been registered and its tasks are about to start.
    fn on_open(&self, _client: &Arc<Client>) {}

    /// A frame whose event is neither `heartbeat` nor `ack`.
    fn on_message(&self, _client: &Arc<Client>, _event: &str, _frame: Bytes) {}

    /// First step of closing; runs exactly once per client.
    fn on_close(&self, _client: &Client, _code: u16, _reason: &str) {}

    /// The client has been fully torn down.
    fn on_destroy(&self, _client: &Client) {}
}

/// Handler that ignores every callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl ClientHandler for NoopHandler {}
