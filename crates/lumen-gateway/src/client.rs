//! Per-connection client
//!
//! A client owns its outbound queue and runs two tasks: the read task decodes
//! inbound frames, the write task drains the queue into the transport.
//! State moves `Open -> Closing -> Closed` exactly once.

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use lumen_observability::logging::connection_span;
use lumen_observability::ConnectionMetrics;
use parking_lot::Mutex;
use tracing::{debug, trace, warn, Instrument};

use crate::ack::AckEntry;
use crate::adapter::Connection;
use crate::channel::Channel;
use crate::error::{GatewayError, GatewayResult, QueueError};
use crate::handler::ClientHandler;
use crate::hub::Hub;
use crate::protocol::{self, close_code};
use crate::queue::{OutboundMessage, OutboundQueue, PushOutcome};

/// Process-unique connection id.
pub type ClientId = i64;

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Open,
    Closing,
    Closed,
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct Client {
    cid: ClientId,
    uid: i64,
    channel: Arc<Channel>,
    conn: Arc<dyn Connection>,
    queue: OutboundQueue,
    /// unix millis of the last inbound frame
    last_heartbeat: AtomicI64,
    state: AtomicU8,
    /// close code reported by the transport, if the peer initiated the close
    peer_close: Mutex<Option<(u16, String)>>,
    handler: Arc<dyn ClientHandler>,
    hub: Hub,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("cid", &self.cid)
            .field("uid", &self.uid)
            .field("channel", &self.channel.name())
            .field("network", &self.conn.network())
            .field("state", &self.state())
            .finish()
    }
}

impl Client {
    /// Registers a freshly accepted connection and starts its read and write tasks.
    pub async fn open(
        hub: Hub,
        conn: Arc<dyn Connection>,
        uid: i64,
        channel: Arc<Channel>,
        handler: Arc<dyn ClientHandler>,
    ) -> Arc<Client> {
        let settings = hub.settings();
        let client = Arc::new(Client {
            cid: hub.next_id(),
            uid,
            channel,
            conn,
            queue: OutboundQueue::new(settings.queue_capacity, settings.overflow),
            last_heartbeat: AtomicI64::new(now_millis()),
            state: AtomicU8::new(STATE_OPEN),
            peer_close: Mutex::new(None),
            handler,
            hub: hub.clone(),
        });

        let weak = Arc::downgrade(&client);
        client.conn.set_close_handler(Arc::new(move |code: u16, reason: String| {
            if let Some(client) = weak.upgrade() {
                *client.peer_close.lock() = Some((code, reason));
            }
        }));

        if let Some(storage) = hub.storage() {
            if let Err(e) = storage.bind(client.channel.name(), client.cid, uid).await {
                warn!(cid = client.cid, uid, "Failed to bind client: {}", e);
            }
        }

        client.channel.add(Arc::clone(&client));
        client.handler.on_open(&client);
        hub.health().insert(Arc::clone(&client));

        let connect =
            protocol::connect_frame(settings.heartbeat_interval, settings.heartbeat_timeout);
        if let Err(e) = client.queue.try_push(OutboundMessage::new(connect)) {
            debug!(cid = client.cid, "Connect frame not queued: {}", e);
        }

        ConnectionMetrics::record_opened(client.conn.network());
        debug!(
            cid = client.cid,
            uid,
            channel = client.channel.name(),
            network = client.conn.network(),
            "Client opened"
        );

        let span = connection_span(client.cid, client.channel.name(), client.conn.network());
        tokio::spawn(Arc::clone(&client).read_loop().instrument(span.clone()));
        tokio::spawn(Arc::clone(&client).write_loop().instrument(span));

        client
    }

    pub fn cid(&self) -> ClientId {
        self.cid
    }

    pub fn uid(&self) -> i64 {
        self.uid
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn network(&self) -> &'static str {
        self.conn.network()
    }

    pub fn state(&self) -> ClientState {
        match self.state.load(Ordering::SeqCst) {
            STATE_OPEN => ClientState::Open,
            STATE_CLOSING => ClientState::Closing,
            _ => ClientState::Closed,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_OPEN
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_CLOSED
    }

    /// Unix millis of the last inbound frame.
    pub fn last_heartbeat(&self) -> i64 {
        self.last_heartbeat.load(Ordering::Relaxed)
    }

    /// Marks the client as alive now.
    pub fn touch(&self) {
        self.last_heartbeat.store(now_millis(), Ordering::Relaxed);
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Enqueue a message, suspending under the `block` overflow policy.
    pub async fn write(&self, message: OutboundMessage) -> GatewayResult<PushOutcome> {
        if !self.is_open() {
            return Err(GatewayError::ClientClosed(self.cid));
        }
        let outcome = self.queue.push(message).await;
        self.enqueued(outcome)
    }

    /// Enqueue without suspending.
    pub fn try_write(&self, message: OutboundMessage) -> GatewayResult<PushOutcome> {
        if !self.is_open() {
            return Err(GatewayError::ClientClosed(self.cid));
        }
        let outcome = self.queue.try_push(message);
        self.enqueued(outcome)
    }

    fn enqueued(&self, outcome: Result<PushOutcome, QueueError>) -> GatewayResult<PushOutcome> {
        match outcome {
            Ok(PushOutcome::DroppedOldest) => {
                ConnectionMetrics::record_queue_dropped();
                trace!(cid = self.cid, "Outbound queue full, dropped oldest message");
                Ok(PushOutcome::DroppedOldest)
            }
            Ok(outcome) => Ok(outcome),
            Err(QueueError::Closed) => Err(GatewayError::ClientClosed(self.cid)),
            Err(e) => Err(e.into()),
        }
    }

    /// Closes the client. Only the first call has any effect; returns whether
    /// this call performed the close.
    pub async fn close(&self, code: u16, reason: &str) -> bool {
        if self
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        self.handler.on_close(self, code, reason);
        self.queue.close();

        if let Some(storage) = self.hub.storage() {
            if let Err(e) = storage.unbind(self.channel.name(), self.cid).await {
                warn!(cid = self.cid, "Failed to unbind client: {}", e);
            }
        }

        self.channel.remove(self.cid);
        self.hub.health().remove(self.cid);

        if let Err(e) = self.conn.close().await {
            debug!(cid = self.cid, "Transport close failed: {}", e);
        }

        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        ConnectionMetrics::record_closed(code);
        debug!(cid = self.cid, uid = self.uid, code, reason, "Client closed");

        self.handler.on_destroy(self);
        true
    }

    async fn read_loop(self: Arc<Self>) {
        loop {
            match self.conn.read().await {
                Ok(frame) => {
                    self.touch();
                    self.dispatch(frame).await;
                }
                Err(e) => {
                    let (code, reason) = self
                        .peer_close
                        .lock()
                        .take()
                        .unwrap_or_else(|| (close_code::ABNORMAL, e.to_string()));
                    self.close(code, &reason).await;
                    break;
                }
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, frame: Bytes) {
        let Some(event) = protocol::peek_event(&frame) else {
            trace!(cid = self.cid, "Dropping frame without event");
            return;
        };

        match event.as_str() {
            protocol::EVENT_HEARTBEAT => {
                if let Err(e) = self.write(OutboundMessage::new(protocol::pong_frame())).await {
                    trace!(cid = self.cid, "Pong not queued: {}", e);
                }
            }
            protocol::EVENT_ACK => match protocol::parse_ack_id(&frame) {
                Some(ack_id) => {
                    self.hub.ack().acknowledge(self.channel.name(), &ack_id);
                }
                None => trace!(cid = self.cid, "Ack frame without ack_id"),
            },
            _ => self.handler.on_message(self, &event, frame),
        }
    }

    async fn write_loop(self: Arc<Self>) {
        while let Some(message) = self.queue.pop().await {
            if let Err(e) = self.conn.write(&message.payload).await {
                warn!(cid = self.cid, "Write failed: {}", e);
                self.close(close_code::ABNORMAL, &e.to_string()).await;
                break;
            }

            if message.ack_required {
                self.hub.ack().add(AckEntry::new(
                    self.channel.name(),
                    self.cid,
                    message.ack_id,
                    message.payload,
                    message.retry + 1,
                ));
            }
        }
    }
}
