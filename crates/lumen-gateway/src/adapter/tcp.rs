//! Raw TCP transport with length-prefixed framing.
//!
//! Frame layout: 4-byte little-endian payload length, then the payload.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use super::{AdapterResult, CloseHandler, CloseHook, Connection};
use crate::error::AdapterError;
use crate::protocol::close_code;

/// Little-endian u32 length prefix, shared by the server and TCP clients.
pub fn frame_codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .little_endian()
        .length_field_length(4)
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

pub struct TcpConnection<S> {
    reader: Mutex<FramedRead<ReadHalf<S>, LengthDelimitedCodec>>,
    writer: Mutex<FramedWrite<WriteHalf<S>, LengthDelimitedCodec>>,
    write_timeout: Duration,
    cancel: CancellationToken,
    closed: AtomicBool,
    on_close: CloseHook,
}

impl<S> TcpConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, max_frame_bytes: usize, write_timeout: Duration) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(FramedRead::new(read_half, frame_codec(max_frame_bytes))),
            writer: Mutex::new(FramedWrite::new(write_half, frame_codec(max_frame_bytes))),
            write_timeout,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            on_close: CloseHook::default(),
        }
    }
}

#[async_trait]
impl<S> Connection for TcpConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn network(&self) -> &'static str {
        "tcp"
    }

    async fn read(&self) -> AdapterResult<Bytes> {
        let mut reader = self.reader.lock().await;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AdapterError::Closed),
            frame = reader.next() => match frame {
                Some(Ok(frame)) => Ok(frame.freeze()),
                Some(Err(e)) => Err(AdapterError::Io(e)),
                None => {
                    self.on_close.fire(close_code::NORMAL, "client closed");
                    Err(AdapterError::Closed)
                }
            },
        }
    }

    async fn write(&self, frame: &[u8]) -> AdapterResult<()> {
        if self.cancel.is_cancelled() {
            return Err(AdapterError::Closed);
        }
        let mut writer = self.writer.lock().await;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AdapterError::Closed),
            res = tokio::time::timeout(self.write_timeout, writer.send(Bytes::copy_from_slice(frame))) => match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(AdapterError::Io(e)),
                Err(_) => Err(AdapterError::Timeout(self.write_timeout)),
            },
        }
    }

    async fn close(&self) -> AdapterResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();

        // a stalled writer bails out on the token above, so the lock is free shortly
        let shutdown = async {
            let mut writer = self.writer.lock().await;
            writer.get_mut().shutdown().await
        };
        match tokio::time::timeout(self.write_timeout, shutdown).await {
            Ok(Ok(())) | Err(_) => Ok(()),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Ok(Err(e)) => Err(AdapterError::Io(e)),
        }
    }

    fn set_close_handler(&self, handler: CloseHandler) {
        self.on_close.set(handler);
    }
}
