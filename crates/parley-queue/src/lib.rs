//! Durable named work queues with manual acknowledgement.
//!
//! A consumed delivery sits in an in-flight list until it is acked, nacked
//! to the back of the ready list, or moved to the dead-letter list. Anything
//! still in flight when a consumer dies is returned by [`WorkQueue::recover`].
//! Each payload carries a count of failed attempts so consumers can give up
//! on a job that keeps failing.

pub mod memory;
pub mod redis_queue;

use std::time::Duration;

use parley_types::BoxFuture;
use serde::Serialize;
use thiserror::Error;

pub use memory::MemoryWorkQueue;
pub use redis_queue::RedisWorkQueue;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("work queue unavailable: {0}")]
    Unavailable(String),
    #[error("work queue serialization error: {0}")]
    Serialization(String),
    #[error("work queue operation failed: {0}")]
    Operation(String),
}

/// A payload taken off a queue and not yet settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub queue: String,
    pub payload: String,
    /// Times this payload was nacked before this delivery.
    pub attempts: u32,
}

pub trait WorkQueue: Send + Sync {
    fn publish(&self, queue: &str, payload: &str) -> BoxFuture<'_, Result<(), QueueError>>;

    /// Waits up to `timeout` for the next payload and moves it in flight.
    fn consume(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<Delivery>, QueueError>>;

    fn ack(&self, delivery: &Delivery) -> BoxFuture<'_, Result<(), QueueError>>;

    /// Counts a failed attempt and returns the delivery to the back of the
    /// ready list, behind jobs published since.
    fn nack(&self, delivery: &Delivery) -> BoxFuture<'_, Result<(), QueueError>>;

    fn dead_letter(&self, delivery: &Delivery) -> BoxFuture<'_, Result<(), QueueError>>;

    /// Moves up to `limit` in-flight payloads back to ready. Returns how many moved.
    fn recover(&self, queue: &str, limit: usize) -> BoxFuture<'_, Result<usize, QueueError>>;
}

pub async fn publish_json<T: Serialize + ?Sized>(
    queue: &dyn WorkQueue,
    name: &str,
    job: &T,
) -> Result<(), QueueError> {
    let payload =
        serde_json::to_string(job).map_err(|err| QueueError::Serialization(err.to_string()))?;
    queue.publish(name, &payload).await
}

/// Exponential back-off in milliseconds, capped at `max_ms`.
pub fn backoff_ms(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    let exp = attempt.saturating_sub(1).min(20);
    base_ms.saturating_mul(1u64 << exp).min(max_ms)
}
