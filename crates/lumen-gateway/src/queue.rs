//! Bounded per-client outbound queue.
//!
//! Many producers, one consumer (the client's write task). Overflow handling
//! follows [`OverflowPolicy`]: `Block` suspends the producer until a slot frees
//! up or the queue closes, `DropOldest` evicts the head and enqueues.

use std::collections::VecDeque;

use bytes::Bytes;
use lumen_config::OverflowPolicy;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::QueueError;

/// 出站消息
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// 需要确认时的 ack id，否则为空
    pub ack_id: String,
    pub ack_required: bool,
    pub retry: u32,
    pub payload: Bytes,
}

impl OutboundMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            ack_id: String::new(),
            ack_required: false,
            retry: 0,
            payload: payload.into(),
        }
    }

    pub fn with_ack(ack_id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            ack_id: ack_id.into(),
            ack_required: true,
            retry: 0,
            payload: payload.into(),
        }
    }

    /// A resend of an unacknowledged message.
    pub fn retried(ack_id: impl Into<String>, payload: Bytes, retry: u32) -> Self {
        Self {
            ack_id: ack_id.into(),
            ack_required: true,
            retry,
            payload,
        }
    }
}

/// Result of a successful enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue was full and its oldest message was discarded.
    DroppedOldest,
}

struct QueueState {
    items: VecDeque<OutboundMessage>,
    closed: bool,
}

pub struct OutboundQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    policy: OverflowPolicy,
    not_empty: Notify,
    not_full: Notify,
}

impl std::fmt::Debug for OutboundQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("OutboundQueue")
            .field("len", &state.items.len())
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("closed", &state.closed)
            .finish()
    }
}

impl OutboundQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            policy,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Enqueue, suspending under `Block` while the queue is full.
    pub async fn push(&self, message: OutboundMessage) -> Result<PushOutcome, QueueError> {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(QueueError::Closed);
                }
                if state.items.len() < self.capacity {
                    state.items.push_back(message);
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(PushOutcome::Queued);
                }
                if self.policy == OverflowPolicy::DropOldest {
                    state.items.pop_front();
                    state.items.push_back(message);
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(PushOutcome::DroppedOldest);
                }
            }

            notified.await;
        }
    }

    /// Enqueue without suspending. Fails with [`QueueError::Full`] under `Block`.
    pub fn try_push(&self, message: OutboundMessage) -> Result<PushOutcome, QueueError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }

        let outcome = if state.items.len() < self.capacity {
            PushOutcome::Queued
        } else if self.policy == OverflowPolicy::DropOldest {
            state.items.pop_front();
            PushOutcome::DroppedOldest
        } else {
            return Err(QueueError::Full);
        };

        state.items.push_back(message);
        drop(state);
        self.not_empty.notify_one();
        Ok(outcome)
    }

    /// Dequeue the next message. Returns `None` once the queue is closed.
    pub async fn pop(&self) -> Option<OutboundMessage> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(message) = state.items.pop_front() {
                    drop(state);
                    self.not_full.notify_one();
                    return Some(message);
                }
            }

            notified.await;
        }
    }

    /// Closes the queue, discarding pending messages and waking every waiter.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.items.clear();
        }
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    fn msg(n: u8) -> OutboundMessage {
        OutboundMessage::new(vec![n])
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = OutboundQueue::new(4, OverflowPolicy::Block);
        for n in 0..4 {
            assert_eq!(queue.push(msg(n)).await, Ok(PushOutcome::Queued));
        }
        for n in 0..4 {
            assert_eq!(queue.pop().await.unwrap().payload[0], n);
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_block_policy_suspends_until_pop() {
        let queue = OutboundQueue::new(1, OverflowPolicy::Block);
        queue.push(msg(1)).await.unwrap();
        assert_eq!(queue.try_push(msg(9)), Err(QueueError::Full));

        let mut producer = task::spawn(queue.push(msg(2)));
        assert_pending!(producer.poll());

        assert_eq!(queue.pop().await.unwrap().payload[0], 1);
        assert!(producer.is_woken());
        assert_ready_eq!(producer.poll(), Ok(PushOutcome::Queued));
        drop(producer);
        assert_eq!(queue.pop().await.unwrap().payload[0], 2);
    }

    #[tokio::test]
    async fn test_drop_oldest_policy() {
        let queue = OutboundQueue::new(2, OverflowPolicy::DropOldest);
        queue.push(msg(1)).await.unwrap();
        queue.push(msg(2)).await.unwrap();
        assert_eq!(queue.push(msg(3)).await, Ok(PushOutcome::DroppedOldest));
        assert_eq!(queue.try_push(msg(4)), Ok(PushOutcome::DroppedOldest));

        assert_eq!(queue.pop().await.unwrap().payload[0], 3);
        assert_eq!(queue.pop().await.unwrap().payload[0], 4);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_producer_and_consumer() {
        let queue = Arc::new(OutboundQueue::new(1, OverflowPolicy::Block));
        queue.push(msg(1)).await.unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.push(msg(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        queue.close();
        assert_eq!(producer.await.unwrap(), Err(QueueError::Closed));
        assert!(queue.pop().await.is_none());
        assert_eq!(queue.try_push(msg(3)), Err(QueueError::Closed));

        let empty = Arc::new(OutboundQueue::new(1, OverflowPolicy::Block));
        let consumer = {
            let empty = Arc::clone(&empty);
            tokio::spawn(async move { empty.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        empty.close();
        assert!(consumer.await.unwrap().is_none());
    }
}
