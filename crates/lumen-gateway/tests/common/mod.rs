#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lumen_gateway::adapter::{AdapterResult, CloseHandler};
use lumen_gateway::{
    AdapterError, Authenticator, Client, ClientHandler, Connection, GatewayError, GatewayResult,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// In-memory transport driven by a [`Peer`].
pub struct MockConnection {
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    outbound: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
    close_calls: AtomicUsize,
    fail_writes: AtomicBool,
    on_close: Mutex<Option<CloseHandler>>,
}

impl MockConnection {
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn network(&self) -> &'static str {
        "mock"
    }

    async fn read(&self) -> AdapterResult<Bytes> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(AdapterError::Closed),
            frame = inbound.recv() => match frame {
                Some(frame) => Ok(frame),
                None => {
                    let handler = self.on_close.lock().clone();
                    if let Some(handler) = handler {
                        handler(1000, "peer closed".to_string());
                    }
                    Err(AdapterError::Closed)
                }
            },
        }
    }

    async fn write(&self, frame: &[u8]) -> AdapterResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AdapterError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "broken pipe",
            )));
        }
        self.outbound
            .send(Bytes::copy_from_slice(frame))
            .map_err(|_| AdapterError::Closed)
    }

    async fn close(&self) -> AdapterResult<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.cancel.cancel();
        Ok(())
    }

    fn set_close_handler(&self, handler: CloseHandler) {
        *self.on_close.lock() = Some(handler);
    }
}

/// The remote end of a [`MockConnection`].
pub struct Peer {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl Peer {
    pub fn send(&self, frame: &str) {
        if let Some(tx) = &self.tx {
            tx.send(Bytes::from(frame.to_string())).unwrap();
        }
    }

    /// Simulates the remote side going away.
    pub fn disconnect(&mut self) {
        self.tx = None;
    }

    pub async fn next_frame(&mut self) -> Option<serde_json::Value> {
        let frame = tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .ok()??;
        Some(serde_json::from_slice(&frame).unwrap())
    }

    /// Next frame whose event is `event`, skipping others.
    pub async fn next_event(&mut self, event: &str) -> serde_json::Value {
        loop {
            let frame = self.next_frame().await.expect("no frame before timeout");
            if frame["event"] == event {
                return frame;
            }
        }
    }

    pub async fn expect_silence(&mut self, within: Duration) {
        assert!(tokio::time::timeout(within, self.rx.recv()).await.is_err());
    }
}

pub fn mock_pair() -> (Arc<MockConnection>, Peer) {
    let (peer_tx, conn_rx) = mpsc::unbounded_channel();
    let (conn_tx, peer_rx) = mpsc::unbounded_channel();
    let conn = Arc::new(MockConnection {
        inbound: tokio::sync::Mutex::new(conn_rx),
        outbound: conn_tx,
        cancel: CancellationToken::new(),
        close_calls: AtomicUsize::new(0),
        fail_writes: AtomicBool::new(false),
        on_close: Mutex::new(None),
    });
    (
        conn,
        Peer {
            tx: Some(peer_tx),
            rx: peer_rx,
        },
    )
}

/// Handler that records every callback.
#[derive(Default)]
pub struct RecordingHandler {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub destroys: AtomicUsize,
    pub close_codes: Mutex<Vec<u16>>,
    pub messages: Mutex<Vec<String>>,
}

impl ClientHandler for RecordingHandler {
    fn on_open(&self, _client: &Arc<Client>) {
        self.opens.fetch_add(1, Ordering::SeqCst);
    }

    fn on_message(&self, _client: &Arc<Client>, event: &str, _frame: Bytes) {
        self.messages.lock().push(event.to_string());
    }

    fn on_close(&self, _client: &Client, code: u16, _reason: &str) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.close_codes.lock().push(code);
    }

    fn on_destroy(&self, _client: &Client) {
        self.destroys.fetch_add(1, Ordering::SeqCst);
    }
}

/// Accepts `token-{uid}` tokens.
pub struct PrefixAuthenticator;

#[async_trait]
impl Authenticator for PrefixAuthenticator {
    async fn authenticate(&self, token: &str) -> GatewayResult<i64> {
        token
            .strip_prefix("token-")
            .and_then(|uid| uid.parse().ok())
            .ok_or_else(|| GatewayError::Unauthorized(format!("bad token {}", token)))
    }
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
