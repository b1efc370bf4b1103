//! WebSocket transport. One socket message is one logical frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use super::{AdapterResult, CloseHandler, CloseHook, Connection};
use crate::error::AdapterError;
use crate::protocol::close_code;

pub struct WebSocketConnection<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
    write_timeout: Duration,
    cancel: CancellationToken,
    closed: AtomicBool,
    on_close: CloseHook,
}

impl<S> WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(ws: WebSocketStream<S>, write_timeout: Duration) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            write_timeout,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            on_close: CloseHook::default(),
        }
    }
}

fn to_message(frame: &[u8]) -> Message {
    match std::str::from_utf8(frame) {
        Ok(text) => Message::Text(text.to_owned()),
        Err(_) => Message::Binary(frame.to_vec()),
    }
}

#[async_trait]
impl<S> Connection for WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn network(&self) -> &'static str {
        "websocket"
    }

    async fn read(&self) -> AdapterResult<Bytes> {
        let mut stream = self.stream.lock().await;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(AdapterError::Closed),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(Message::Text(text))) => return Ok(Bytes::from(text)),
                Some(Ok(Message::Binary(data))) => return Ok(Bytes::from(data)),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((close_code::NORMAL, String::new()));
                    self.on_close.fire(code, reason);
                    return Err(AdapterError::Closed);
                }
                // ping/pong are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(AdapterError::WebSocket(e)),
                None => return Err(AdapterError::Closed),
            }
        }
    }

    async fn write(&self, frame: &[u8]) -> AdapterResult<()> {
        if self.cancel.is_cancelled() {
            return Err(AdapterError::Closed);
        }
        let mut sink = self.sink.lock().await;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AdapterError::Closed),
            res = tokio::time::timeout(self.write_timeout, sink.send(to_message(frame))) => match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(AdapterError::WebSocket(e)),
                Err(_) => Err(AdapterError::Timeout(self.write_timeout)),
            },
        }
    }

    async fn close(&self) -> AdapterResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();

        let shutdown = async {
            let mut sink = self.sink.lock().await;
            sink.close().await
        };
        // the peer may already be gone; nothing left to report in that case
        let _ = tokio::time::timeout(self.write_timeout, shutdown).await;
        Ok(())
    }

    fn set_close_handler(&self, handler: CloseHandler) {
        self.on_close.set(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;
    use std::sync::Arc;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};

    async fn pair() -> (WebSocketConnection<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (server, client) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        (
            WebSocketConnection::new(server, Duration::from_millis(200)),
            client,
        )
    }

    #[tokio::test]
    async fn test_text_and_binary_frames() {
        let (conn, mut client) = pair().await;

        client
            .send(Message::Text(r#"{"event":"heartbeat"}"#.to_string()))
            .await
            .unwrap();
        client.send(Message::Binary(vec![0xff, 0x00])).await.unwrap();

        assert_eq!(&conn.read().await.unwrap()[..], br#"{"event":"heartbeat"}"#);
        assert_eq!(&conn.read().await.unwrap()[..], &[0xff, 0x00]);

        conn.write(br#"{"event":"heartbeat","content":"pong"}"#)
            .await
            .unwrap();
        match client.next().await {
            Some(Ok(Message::Text(text))) => assert!(text.contains("pong")),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ping_is_not_surfaced() {
        let (conn, mut client) = pair().await;

        client.send(Message::Ping(vec![1, 2, 3])).await.unwrap();
        client.send(Message::Text("after-ping".to_string())).await.unwrap();

        assert_eq!(&conn.read().await.unwrap()[..], b"after-ping");
    }

    #[tokio::test]
    async fn test_close_frame_fires_handler_with_peer_code() {
        let (conn, mut client) = pair().await;
        let seen = Arc::new(parking_lot::Mutex::new(None));
        {
            let seen = Arc::clone(&seen);
            conn.set_close_handler(Arc::new(move |code: u16, reason: String| {
                *seen.lock() = Some((code, reason));
            }));
        }

        client
            .close(Some(CloseFrame {
                code: CloseCode::from(4001),
                reason: Cow::Borrowed("logout"),
            }))
            .await
            .unwrap();

        assert!(matches!(conn.read().await, Err(AdapterError::Closed)));
        assert_eq!(*seen.lock(), Some((4001, "logout".to_string())));
    }

    #[tokio::test]
    async fn test_close_unblocks_read() {
        let (conn, _client) = pair().await;
        let conn = Arc::new(conn);

        let reader = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.read().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        conn.close().await.unwrap();
        assert!(matches!(reader.await.unwrap(), Err(AdapterError::Closed)));
        assert!(matches!(conn.write(b"late").await, Err(AdapterError::Closed)));
    }
}
