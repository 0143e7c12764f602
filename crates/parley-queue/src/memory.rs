use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parley_types::BoxFuture;
use tokio::sync::{Mutex, Notify};

use crate::{Delivery, QueueError, WorkQueue};

#[derive(Default)]
struct Lists {
    ready: VecDeque<String>,
    processing: Vec<String>,
    dead: Vec<String>,
    attempts: HashMap<String, u32>,
}

impl Lists {
    fn take_in_flight(&mut self, payload: &str) -> Option<String> {
        let pos = self.processing.iter().position(|p| p == payload)?;
        Some(self.processing.remove(pos))
    }
}

/// In-process fake with the same settle semantics as the Redis queue.
#[derive(Clone, Default)]
pub struct MemoryWorkQueue {
    queues: Arc<Mutex<HashMap<String, Lists>>>,
    notify: Arc<Notify>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn ready(&self, queue: &str) -> Vec<String> {
        let queues = self.queues.lock().await;
        queues
            .get(queue)
            .map(|l| l.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn in_flight(&self, queue: &str) -> usize {
        let queues = self.queues.lock().await;
        queues.get(queue).map(|l| l.processing.len()).unwrap_or(0)
    }

    pub async fn dead_letters(&self, queue: &str) -> Vec<String> {
        let queues = self.queues.lock().await;
        queues.get(queue).map(|l| l.dead.clone()).unwrap_or_default()
    }

    /// Failed attempts recorded for a payload that is not yet settled.
    pub async fn attempts(&self, queue: &str, payload: &str) -> u32 {
        let queues = self.queues.lock().await;
        queues
            .get(queue)
            .and_then(|l| l.attempts.get(payload).copied())
            .unwrap_or(0)
    }

    fn check(&self) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("queue offline".into()));
        }
        Ok(())
    }
}

impl WorkQueue for MemoryWorkQueue {
    fn publish(&self, queue: &str, payload: &str) -> BoxFuture<'_, Result<(), QueueError>> {
        let queue = queue.to_string();
        let payload = payload.to_string();
        Box::pin(async move {
            self.check()?;
            self.queues.lock().await.entry(queue).or_default().ready.push_back(payload);
            self.notify.notify_one();
            Ok(())
        })
    }

    fn consume(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<Delivery>, QueueError>> {
        let queue = queue.to_string();
        Box::pin(async move {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                self.check()?;
                {
                    let mut queues = self.queues.lock().await;
                    let lists = queues.entry(queue.clone()).or_default();
                    if let Some(payload) = lists.ready.pop_front() {
                        lists.processing.push(payload.clone());
                        let attempts = lists.attempts.get(&payload).copied().unwrap_or(0);
                        return Ok(Some(Delivery {
                            queue,
                            payload,
                            attempts,
                        }));
                    }
                }
                if tokio::time::timeout_at(deadline, self.notify.notified()).await.is_err() {
                    return Ok(None);
                }
            }
        })
    }

    fn ack(&self, delivery: &Delivery) -> BoxFuture<'_, Result<(), QueueError>> {
        let delivery = delivery.clone();
        Box::pin(async move {
            self.check()?;
            let mut queues = self.queues.lock().await;
            if let Some(lists) = queues.get_mut(&delivery.queue) {
                if lists.take_in_flight(&delivery.payload).is_some() {
                    lists.attempts.remove(&delivery.payload);
                }
            }
            Ok(())
        })
    }

    fn nack(&self, delivery: &Delivery) -> BoxFuture<'_, Result<(), QueueError>> {
        let delivery = delivery.clone();
        Box::pin(async move {
            self.check()?;
            let mut queues = self.queues.lock().await;
            let lists = queues.entry(delivery.queue).or_default();
            if let Some(payload) = lists.take_in_flight(&delivery.payload) {
                *lists.attempts.entry(payload.clone()).or_insert(0) += 1;
                lists.ready.push_back(payload);
                self.notify.notify_one();
            }
            Ok(())
        })
    }

    fn dead_letter(&self, delivery: &Delivery) -> BoxFuture<'_, Result<(), QueueError>> {
        let delivery = delivery.clone();
        Box::pin(async move {
            self.check()?;
            let mut queues = self.queues.lock().await;
            let lists = queues.entry(delivery.queue).or_default();
            if let Some(payload) = lists.take_in_flight(&delivery.payload) {
                lists.attempts.remove(&payload);
                lists.dead.push(payload);
            }
            Ok(())
        })
    }

    fn recover(&self, queue: &str, limit: usize) -> BoxFuture<'_, Result<usize, QueueError>> {
        let queue = queue.to_string();
        Box::pin(async move {
            self.check()?;
            let mut queues = self.queues.lock().await;
            let lists = queues.entry(queue).or_default();
            let take = limit.min(lists.processing.len());
            let moved: Vec<String> = lists.processing.drain(..take).collect();
            for payload in moved.into_iter().rev() {
                lists.ready.push_front(payload);
            }
            if take > 0 {
                self.notify.notify_one();
            }
            Ok(take)
        })
    }
}
