use std::time::Duration;

use parley_types::BoxFuture;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Value};
use tracing::info;

use crate::{Delivery, QueueError, WorkQueue};

const DEFAULT_PREFIX: &str = "queue";

/// Reliable-list queue: `LPUSH` onto ready, `BRPOPLPUSH` into processing,
/// `LREM` on settle. Failed attempts are counted in a `<queue>:attempts` hash
/// keyed by payload. Durability follows the Redis server's persistence config.
#[derive(Clone)]
pub struct RedisWorkQueue {
    manager: ConnectionManager,
    prefix: String,
}

impl RedisWorkQueue {
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        Self::connect_with_prefix(redis_url, DEFAULT_PREFIX).await
    }

    pub async fn connect_with_prefix(
        redis_url: &str,
        prefix: impl Into<String>,
    ) -> Result<Self, QueueError> {
        let client =
            redis::Client::open(redis_url).map_err(|err| QueueError::Unavailable(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| QueueError::Unavailable(err.to_string()))?;
        info!("Work queue connected at {}", redis_url);
        Ok(Self {
            manager,
            prefix: prefix.into(),
        })
    }

    fn ready_key(&self, queue: &str) -> String {
        format!("{}:{queue}", self.prefix)
    }

    fn processing_key(&self, queue: &str) -> String {
        format!("{}:{queue}:processing", self.prefix)
    }

    fn dead_key(&self, queue: &str) -> String {
        format!("{}:{queue}:dead", self.prefix)
    }

    fn attempts_key(&self, queue: &str) -> String {
        format!("{}:{queue}:attempts", self.prefix)
    }
}

fn map_err(err: RedisError) -> QueueError {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        QueueError::Unavailable(err.to_string())
    } else {
        QueueError::Operation(err.to_string())
    }
}

impl WorkQueue for RedisWorkQueue {
    fn publish(&self, queue: &str, payload: &str) -> BoxFuture<'_, Result<(), QueueError>> {
        let ready_key = self.ready_key(queue);
        let payload = payload.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let _: i64 = conn.lpush(ready_key, payload).await.map_err(map_err)?;
            Ok(())
        })
    }

    fn consume(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<Delivery>, QueueError>> {
        let ready_key = self.ready_key(queue);
        let processing_key = self.processing_key(queue);
        let attempts_key = self.attempts_key(queue);
        let queue = queue.to_string();
        let timeout_secs = timeout.as_secs().max(1);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let payload: Option<String> = redis::cmd("BRPOPLPUSH")
                .arg(&ready_key)
                .arg(&processing_key)
                .arg(timeout_secs)
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            let Some(payload) = payload else {
                return Ok(None);
            };
            let attempts: Option<u32> = conn.hget(&attempts_key, &payload).await.map_err(map_err)?;
            Ok(Some(Delivery {
                queue,
                payload,
                attempts: attempts.unwrap_or(0),
            }))
        })
    }

    fn ack(&self, delivery: &Delivery) -> BoxFuture<'_, Result<(), QueueError>> {
        let processing_key = self.processing_key(&delivery.queue);
        let attempts_key = self.attempts_key(&delivery.queue);
        let payload = delivery.payload.clone();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let _: Vec<Value> = redis::pipe()
                .atomic()
                .cmd("LREM")
                .arg(&processing_key)
                .arg(1)
                .arg(&payload)
                .cmd("HDEL")
                .arg(&attempts_key)
                .arg(&payload)
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            Ok(())
        })
    }

    fn nack(&self, delivery: &Delivery) -> BoxFuture<'_, Result<(), QueueError>> {
        let processing_key = self.processing_key(&delivery.queue);
        let ready_key = self.ready_key(&delivery.queue);
        let attempts_key = self.attempts_key(&delivery.queue);
        let payload = delivery.payload.clone();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let _: Vec<Value> = redis::pipe()
                .atomic()
                .cmd("LREM")
                .arg(&processing_key)
                .arg(1)
                .arg(&payload)
                .cmd("HINCRBY")
                .arg(&attempts_key)
                .arg(&payload)
                .arg(1)
                .cmd("LPUSH")
                .arg(&ready_key)
                .arg(&payload)
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            Ok(())
        })
    }

    fn dead_letter(&self, delivery: &Delivery) -> BoxFuture<'_, Result<(), QueueError>> {
        let processing_key = self.processing_key(&delivery.queue);
        let dead_key = self.dead_key(&delivery.queue);
        let attempts_key = self.attempts_key(&delivery.queue);
        let payload = delivery.payload.clone();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let _: Vec<Value> = redis::pipe()
                .atomic()
                .cmd("LREM")
                .arg(&processing_key)
                .arg(1)
                .arg(&payload)
                .cmd("HDEL")
                .arg(&attempts_key)
                .arg(&payload)
                .cmd("LPUSH")
                .arg(&dead_key)
                .arg(&payload)
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            Ok(())
        })
    }

    fn recover(&self, queue: &str, limit: usize) -> BoxFuture<'_, Result<usize, QueueError>> {
        let processing_key = self.processing_key(queue);
        let ready_key = self.ready_key(queue);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let mut moved = 0usize;
            for _ in 0..limit {
                let payload: Option<String> = redis::cmd("RPOPLPUSH")
                    .arg(&processing_key)
                    .arg(&ready_key)
                    .query_async(&mut conn)
                    .await
                    .map_err(map_err)?;
                if payload.is_none() {
                    break;
                }
                moved += 1;
            }
            Ok(moved)
        })
    }
}
