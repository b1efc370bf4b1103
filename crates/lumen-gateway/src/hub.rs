//! Shared gateway state
//!
//! One [`Hub`] is built at startup and cloned into every client. It owns the
//! connection id counter, the channel registry, the heartbeat monitor and the
//! ack buffer.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lumen_config::OverflowPolicy;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ack::AckBuffer;
use crate::channel::Channels;
use crate::client::ClientId;
use crate::health::HealthMonitor;
use crate::presence::ClientStorage;

/// Runtime knobs for the hub, derived from [`lumen_config::Config`].
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub ack_resend_interval: Duration,
    pub ack_max_retry: u32,
    pub ack_sweep_interval: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self::from(&lumen_config::Config::default())
    }
}

impl From<&lumen_config::Config> for HubSettings {
    fn from(config: &lumen_config::Config) -> Self {
        Self {
            heartbeat_interval: config.heartbeat.interval(),
            heartbeat_timeout: config.heartbeat.timeout(),
            sweep_interval: config.heartbeat.sweep_interval(),
            queue_capacity: config.queue.capacity,
            overflow: config.queue.overflow,
            ack_resend_interval: config.ack.resend_interval(),
            ack_max_retry: config.ack.max_retry,
            ack_sweep_interval: config.ack.sweep_interval(),
        }
    }
}

#[derive(Clone)]
pub struct Hub {
    ids: Arc<AtomicI64>,
    channels: Arc<Channels>,
    health: Arc<HealthMonitor>,
    ack: Arc<AckBuffer>,
    storage: Option<Arc<dyn ClientStorage>>,
    settings: Arc<HubSettings>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("channels", &self.channels)
            .field("health", &self.health)
            .field("ack", &self.ack)
            .field("storage", &self.storage.is_some())
            .field("settings", &self.settings)
            .finish()
    }
}

impl Hub {
    pub fn new(settings: HubSettings) -> Self {
        let channels = Arc::new(Channels::new());
        let health = Arc::new(HealthMonitor::new(
            settings.heartbeat_timeout,
            settings.sweep_interval,
        ));
        let ack = Arc::new(AckBuffer::new(
            Arc::clone(&channels),
            settings.ack_resend_interval,
            settings.ack_max_retry,
            settings.ack_sweep_interval,
        ));

        Self {
            ids: Arc::new(AtomicI64::new(0)),
            channels,
            health,
            ack,
            storage: None,
            settings: Arc::new(settings),
        }
    }

    /// Attaches the presence store that clients bind into on open.
    pub fn with_storage(mut self, storage: Arc<dyn ClientStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// 生成进程内唯一的连接 ID
    pub fn next_id(&self) -> ClientId {
        self.ids.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn channels(&self) -> &Arc<Channels> {
        &self.channels
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn ack(&self) -> &Arc<AckBuffer> {
        &self.ack
    }

    pub fn storage(&self) -> Option<&Arc<dyn ClientStorage>> {
        self.storage.as_ref()
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    /// Spawns the heartbeat and ack passes. Both stop when `cancel` fires.
    pub fn start(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(&self.health).run(cancel.clone())),
            tokio::spawn(Arc::clone(&self.ack).run(cancel)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let hub = Hub::new(HubSettings::default());
        let a = hub.next_id();
        let b = hub.clone().next_id();
        assert!(b > a);
        assert!(a > 0);
    }

    #[test]
    fn test_settings_follow_config() {
        let mut config = lumen_config::Config::default();
        config.heartbeat.interval_secs = 10;
        config.heartbeat.timeout_secs = 25;
        config.queue.capacity = 64;
        config.queue.overflow = OverflowPolicy::DropOldest;

        let settings = HubSettings::from(&config);
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(settings.heartbeat_timeout, Duration::from_secs(25));
        assert_eq!(settings.queue_capacity, 64);
        assert_eq!(settings.overflow, OverflowPolicy::DropOldest);
        assert_eq!(settings.ack_max_retry, 3);
    }

    #[tokio::test]
    async fn test_start_and_cancel() {
        let hub = Hub::new(HubSettings::default());
        let cancel = CancellationToken::new();
        let handles = hub.start(cancel.clone());
        assert_eq!(handles.len(), 2);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
