//! Redis backend

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{KvStore, TopicMessage};
use crate::error::StoreResult;

const SUBSCRIBE_BUFFER: usize = 1024;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Redis-backed [`KvStore`] sharing one multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("addr", &self.client.get_connection_info().addr)
            .finish()
    }
}

impl RedisStore {
    /// Connects to `redis_url`, e.g. `redis://127.0.0.1:6379/0`.
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("Connected to Redis at {}", client.get_connection_info().addr);
        Ok(Self { client, conn })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

async fn open_pubsub(client: &redis::Client, topics: &[String]) -> StoreResult<PubSub> {
    let mut pubsub = client.get_async_pubsub().await?;
    for topic in topics {
        pubsub.subscribe(topic).await?;
    }
    Ok(pubsub)
}

/// Pumps messages into `tx`, reconnecting on loss, until the receiver is dropped.
async fn pump(client: redis::Client, topics: Vec<String>, first: PubSub, tx: mpsc::Sender<TopicMessage>) {
    let mut next = Some(first);
    loop {
        let pubsub = match next.take() {
            Some(pubsub) => pubsub,
            None => match open_pubsub(&client, &topics).await {
                Ok(pubsub) => {
                    info!(?topics, "Redis subscription restored");
                    pubsub
                }
                Err(e) => {
                    warn!("Redis resubscribe failed: {}", e);
                    tokio::select! {
                        _ = tx.closed() => return,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                    }
                }
            },
        };

        let mut messages = pubsub.into_on_message();
        loop {
            let msg = tokio::select! {
                _ = tx.closed() => return,
                msg = messages.next() => msg,
            };
            let Some(msg) = msg else { break };

            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    debug!("Dropping undecodable pub/sub payload: {}", e);
                    continue;
                }
            };
            let message = TopicMessage {
                topic: msg.get_channel_name().to_string(),
                payload,
            };
            if tx.send(message).await.is_err() {
                return;
            }
        }

        warn!("Redis subscription lost, reconnecting");
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.conn().get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.conn().set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.conn()
            .set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut self.conn())
            .await?;
        Ok(reply.is_some())
    }

    async fn incr_by(&self, key: &str, delta: i64, ttl: Option<Duration>) -> StoreResult<i64> {
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("INCRBY").arg(key).arg(delta);
        if let Some(ttl) = ttl {
            pipe.cmd("EXPIRE").arg(key).arg(ttl.as_secs().max(1)).ignore();
        }
        let (value,): (i64,) = pipe.query_async(&mut self.conn()).await?;
        Ok(value)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.conn().exists(key).await?)
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        self.conn().del::<_, ()>(key).await?;
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.conn().hset::<_, _, _, ()>(key, field, value).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        Ok(self.conn().hget(key, field).await?)
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<()> {
        self.conn().hdel::<_, _, ()>(key, field).await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        Ok(self.conn().hgetall(key).await?)
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<()> {
        self.conn().sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<()> {
        self.conn().srem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        Ok(self.conn().smembers(key).await?)
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        Ok(self.conn().sismember(key, member).await?)
    }

    async fn scard(&self, key: &str) -> StoreResult<usize> {
        Ok(self.conn().scard(key).await?)
    }

    async fn publish(&self, topic: &str, payload: &str) -> StoreResult<()> {
        self.conn().publish::<_, _, ()>(topic, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> StoreResult<mpsc::Receiver<TopicMessage>> {
        // the first connect is reported to the caller; later losses are retried
        let first = open_pubsub(&self.client, topics).await?;
        let (tx, rx) = mpsc::channel(SUBSCRIBE_BUFFER);
        tokio::spawn(pump(self.client.clone(), topics.to_vec(), first, tx));
        Ok(rx)
    }

    async fn ping(&self) -> StoreResult<()> {
        let _: String = redis::cmd("PING").query_async(&mut self.conn()).await?;
        Ok(())
    }
}
