//! 消息时序发号器
//!
//! Per-conversation monotonic counters living in the [`KvStore`]. Private
//! chats share one counter per user pair, groups one counter per group id.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lumen_observability::SequenceMetrics;
use tracing::{debug, warn};

use crate::error::GatewayResult;
use crate::store::KvStore;

const KEY_PREFIX: &str = "im:sequence:msg";

/// Source of the last sequence already used by a conversation, consulted
/// when its counter is missing from the store.
#[async_trait]
pub trait SequenceSeed: Send + Sync {
    async fn current(&self, a: i64, b: i64) -> GatewayResult<i64>;
}

#[derive(Clone)]
pub struct SequenceGenerator {
    store: Arc<dyn KvStore>,
    ttl: Duration,
    seed: Option<Arc<dyn SequenceSeed>>,
}

impl std::fmt::Debug for SequenceGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceGenerator")
            .field("ttl", &self.ttl)
            .field("seeded", &self.seed.is_some())
            .finish()
    }
}

impl SequenceGenerator {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: Arc<dyn SequenceSeed>) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Counter key. `0` on either side selects the group key of the other id;
    /// otherwise the pair is ordered so `name(a, b) == name(b, a)`.
    pub fn name(a: i64, b: i64) -> String {
        if a == 0 || b == 0 {
            return format!("{}:{}", KEY_PREFIX, a.max(b));
        }
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        format!("{}:{}_{}", KEY_PREFIX, low, high)
    }

    /// 初始化发号器
    pub async fn init(&self, a: i64, b: i64, value: i64) -> GatewayResult<()> {
        let key = Self::name(a, b);
        self.store.set_ex(&key, &value.to_string(), self.ttl).await?;
        debug!(key = %key, value, "Sequence initialized");
        Ok(())
    }

    /// 获取下一个时序 ID
    pub async fn get(&self, a: i64, b: i64) -> GatewayResult<i64> {
        self.allocate(a, b, 1).await
    }

    /// Allocates `n` contiguous values and returns them ascending.
    pub async fn batch_get(&self, a: i64, b: i64, n: u32) -> GatewayResult<Vec<i64>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let n = i64::from(n);
        let last = self.allocate(a, b, n).await?;
        Ok((last - n + 1..=last).collect())
    }

    async fn allocate(&self, a: i64, b: i64, n: i64) -> GatewayResult<i64> {
        let key = Self::name(a, b);

        if let Some(seed) = &self.seed {
            if let Err(e) = self.ensure_seeded(&key, seed.as_ref(), a, b).await {
                SequenceMetrics::record_error();
                return Err(e);
            }
        }

        match self.store.incr_by(&key, n, Some(self.ttl)).await {
            Ok(value) => {
                SequenceMetrics::record_allocated(n as u64);
                Ok(value)
            }
            Err(e) => {
                warn!(key = %key, "Sequence allocation failed: {}", e);
                SequenceMetrics::record_error();
                Err(e.into())
            }
        }
    }

    async fn ensure_seeded(
        &self,
        key: &str,
        seed: &dyn SequenceSeed,
        a: i64,
        b: i64,
    ) -> GatewayResult<()> {
        if self.store.exists(key).await? {
            return Ok(());
        }
        let current = seed.current(a, b).await?;
        // a concurrent allocator may have seeded first; its value wins
        if self
            .store
            .set_nx_ex(key, &current.to_string(), self.ttl)
            .await?
        {
            debug!(key = %key, current, "Sequence seeded");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TTL: Duration = Duration::from_secs(12 * 60 * 60);

    fn generator() -> (Arc<MemoryStore>, SequenceGenerator) {
        let store = Arc::new(MemoryStore::new());
        let generator = SequenceGenerator::new(store.clone(), TTL);
        (store, generator)
    }

    #[test]
    fn test_name_is_symmetric() {
        for (a, b) in [(3, 9), (9, 3), (1, 1), (100, 7)] {
            assert_eq!(SequenceGenerator::name(a, b), SequenceGenerator::name(b, a));
        }
        assert_eq!(SequenceGenerator::name(9, 3), "im:sequence:msg:3_9");
        assert_eq!(SequenceGenerator::name(0, 42), "im:sequence:msg:42");
        assert_eq!(SequenceGenerator::name(42, 0), "im:sequence:msg:42");
    }

    #[tokio::test]
    async fn test_init_then_get_and_batch() {
        let (_, seq) = generator();
        seq.init(0, 42, 100).await.unwrap();
        assert_eq!(seq.get(0, 42).await.unwrap(), 101);
        assert_eq!(seq.batch_get(0, 42, 3).await.unwrap(), vec![102, 103, 104]);
        assert_eq!(seq.get(0, 42).await.unwrap(), 105);
    }

    #[tokio::test]
    async fn test_private_counter_shared_by_both_sides() {
        let (_, seq) = generator();
        assert_eq!(seq.get(3, 9).await.unwrap(), 1);
        assert_eq!(seq.get(9, 3).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_get_refreshes_expiry() {
        let (store, seq) = generator();
        seq.get(3, 9).await.unwrap();
        let ttl = store.ttl(&SequenceGenerator::name(3, 9)).unwrap();
        assert!(ttl > Duration::from_secs(60 * 60));
    }

    #[tokio::test]
    async fn test_zero_batch_does_not_touch_store() {
        let (store, seq) = generator();
        store.set_fail_all(true);
        assert!(seq.batch_get(3, 9, 0).await.unwrap().is_empty());
        assert!(seq.get(3, 9).await.is_err());
    }

    struct FixedSeed {
        value: i64,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SequenceSeed for FixedSeed {
        async fn current(&self, _a: i64, _b: i64) -> GatewayResult<i64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.value)
        }
    }

    #[tokio::test]
    async fn test_seed_only_used_for_missing_key() {
        let (_, seq) = generator();
        let seed = Arc::new(FixedSeed {
            value: 500,
            calls: AtomicUsize::new(0),
        });
        let seq = seq.with_seed(seed.clone());

        assert_eq!(seq.get(3, 9).await.unwrap(), 501);
        assert_eq!(seq.get(3, 9).await.unwrap(), 502);
        assert_eq!(seed.calls.load(Ordering::SeqCst), 1);
    }
}
