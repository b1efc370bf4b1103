//! Acknowledgement buffer
//!
//! Every ack-required message that reached the transport is parked here until
//! the client echoes its ack id. A background pass resends stale entries and
//! drops them once the retry ceiling is exceeded.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use lumen_observability::AckMetrics;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::channel::Channels;
use crate::client::ClientId;
use crate::error::{GatewayError, QueueError};
use crate::queue::OutboundMessage;

/// 待确认消息
#[derive(Debug, Clone)]
pub struct AckEntry {
    pub channel: String,
    pub cid: ClientId,
    pub ack_id: String,
    pub payload: Bytes,
    /// 已发送次数
    pub retry: u32,
    pub created_at: Instant,
}

impl AckEntry {
    pub fn new(
        channel: impl Into<String>,
        cid: ClientId,
        ack_id: impl Into<String>,
        payload: Bytes,
        retry: u32,
    ) -> Self {
        Self {
            channel: channel.into(),
            cid,
            ack_id: ack_id.into(),
            payload,
            retry,
            created_at: Instant::now(),
        }
    }

    fn key(&self) -> (String, String) {
        (self.channel.clone(), self.ack_id.clone())
    }
}

/// Result of one resend pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AckSweep {
    pub resent: usize,
    pub dropped: usize,
    /// Entries kept for the next pass because the client's queue was full.
    pub deferred: usize,
}

pub struct AckBuffer {
    entries: DashMap<(String, String), AckEntry>,
    channels: Arc<Channels>,
    resend_interval: Duration,
    max_retry: u32,
    sweep_interval: Duration,
}

impl std::fmt::Debug for AckBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckBuffer")
            .field("pending", &self.entries.len())
            .field("resend_interval", &self.resend_interval)
            .field("max_retry", &self.max_retry)
            .finish()
    }
}

impl AckBuffer {
    pub fn new(
        channels: Arc<Channels>,
        resend_interval: Duration,
        max_retry: u32,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            channels,
            resend_interval,
            max_retry,
            sweep_interval,
        }
    }

    /// Inserts or replaces the entry for `(channel, ack_id)`.
    pub fn add(&self, entry: AckEntry) {
        trace!(cid = entry.cid, ack_id = %entry.ack_id, retry = entry.retry, "Awaiting ack");
        self.entries.insert(entry.key(), entry);
        AckMetrics::record_registered();
    }

    /// 客户端确认消息，返回条目是否存在
    pub fn acknowledge(&self, channel: &str, ack_id: &str) -> bool {
        let removed = self
            .entries
            .remove(&(channel.to_string(), ack_id.to_string()))
            .is_some();
        if removed {
            AckMetrics::record_acknowledged();
        }
        removed
    }

    pub fn contains(&self, channel: &str, ack_id: &str) -> bool {
        self.entries
            .contains_key(&(channel.to_string(), ack_id.to_string()))
    }

    /// Retry count of a pending entry.
    pub fn retry_of(&self, channel: &str, ack_id: &str) -> Option<u32> {
        self.entries
            .get(&(channel.to_string(), ack_id.to_string()))
            .map(|entry| entry.retry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resends every entry older than the resend interval.
    pub fn sweep(&self, now: Instant) -> AckSweep {
        let due: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.created_at) >= self.resend_interval)
            .map(|entry| entry.key().clone())
            .collect();

        let mut report = AckSweep::default();
        for key in due {
            // an ack may have raced us between collect and remove
            let Some((_, entry)) = self.entries.remove(&key) else {
                continue;
            };

            if entry.retry > self.max_retry {
                debug!(cid = entry.cid, ack_id = %entry.ack_id, retry = entry.retry, "Ack retries exhausted");
                AckMetrics::record_dropped("retry_exhausted");
                report.dropped += 1;
                continue;
            }

            let Some(client) = self
                .channels
                .get(&entry.channel)
                .and_then(|channel| channel.get(entry.cid))
            else {
                AckMetrics::record_dropped("client_gone");
                report.dropped += 1;
                continue;
            };

            let message = OutboundMessage::retried(entry.ack_id.clone(), entry.payload.clone(), entry.retry);
            match client.try_write(message) {
                Ok(_) => {
                    AckMetrics::record_resent();
                    report.resent += 1;
                }
                Err(GatewayError::Queue(QueueError::Full)) => {
                    let key = entry.key();
                    self.entries.entry(key).or_insert(AckEntry {
                        created_at: now,
                        ..entry
                    });
                    report.deferred += 1;
                }
                Err(_) => {
                    AckMetrics::record_dropped("client_gone");
                    report.dropped += 1;
                }
            }
        }

        AckMetrics::set_pending(self.entries.len());
        report
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(max_retry = self.max_retry, "Ack buffer started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.sweep(Instant::now());
                    if report != AckSweep::default() {
                        debug!(
                            resent = report.resent,
                            dropped = report.dropped,
                            deferred = report.deferred,
                            "Ack sweep"
                        );
                    }
                }
            }
        }

        info!(pending = self.entries.len(), "Ack buffer stopped");
    }
}
