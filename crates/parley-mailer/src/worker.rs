use std::sync::Arc;
use std::time::Duration;

use parley_queue::{QueueError, WorkQueue, backoff_ms};
use parley_types::jobs::{MailJob, OTP_QUEUE};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// How many in-flight jobs a starting worker reclaims from a previous run.
const RECOVER_LIMIT: usize = 1_000;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub poll_timeout: Duration,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Send attempts per job before it is dead-lettered.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(5),
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Idle,
    Sent,
    /// Delivery failed; the job is back at the end of the ready list.
    Retried,
    /// Unparseable, permanently rejected, or out of attempts. Moved aside.
    DeadLettered,
}

/// Single serialized consumer of the OTP queue. At most one job is in
/// flight, and a job is acked only after its mail was handed off.
pub struct MailWorker {
    queue: Arc<dyn WorkQueue>,
    transport: Arc<dyn crate::MailTransport>,
    policy: RetryPolicy,
}

impl MailWorker {
    pub fn new(queue: Arc<dyn WorkQueue>, transport: Arc<dyn crate::MailTransport>) -> Self {
        Self {
            queue,
            transport,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Runs until `shutdown` flips to true. A job interrupted by shutdown
    /// stays in flight and is reclaimed by the next start.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), QueueError> {
        let recovered = self.queue.recover(OTP_QUEUE, RECOVER_LIMIT).await?;
        if recovered > 0 {
            warn!("Requeued {} mail job(s) left in flight by a previous run", recovered);
        }
        info!("Mail worker consuming '{}'", OTP_QUEUE);

        let mut failures: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let outcome = tokio::select! {
                _ = shutdown.changed() => break,
                outcome = self.process_next() => outcome,
            };

            let pause = match outcome {
                Ok(Outcome::Retried) => {
                    failures += 1;
                    Some(backoff_ms(failures, self.policy.base_backoff_ms, self.policy.max_backoff_ms))
                }
                Ok(_) => {
                    failures = 0;
                    None
                }
                Err(e) => {
                    failures += 1;
                    error!("Mail queue error: {}", e);
                    Some(backoff_ms(failures, self.policy.base_backoff_ms, self.policy.max_backoff_ms))
                }
            };

            if let Some(ms) = pause {
                debug!("Backing off {}ms after {} consecutive failure(s)", ms, failures);
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                }
            }
        }

        info!("Mail worker stopped");
        Ok(())
    }

    /// Takes at most one job and settles it.
    pub async fn process_next(&self) -> Result<Outcome, QueueError> {
        let Some(delivery) = self.queue.consume(OTP_QUEUE, self.policy.poll_timeout).await? else {
            return Ok(Outcome::Idle);
        };

        let job: MailJob = match serde_json::from_str(&delivery.payload) {
            Ok(job) => job,
            Err(e) => {
                warn!("Dead-lettering malformed mail job: {} -- raw: {}", e, delivery.payload);
                self.queue.dead_letter(&delivery).await?;
                return Ok(Outcome::DeadLettered);
            }
        };

        match self.transport.send(&job).await {
            Ok(()) => {
                self.queue.ack(&delivery).await?;
                info!("OTP mail sent to {}", job.to);
                Ok(Outcome::Sent)
            }
            Err(e) => {
                let attempt = delivery.attempts + 1;
                if e.is_permanent() || attempt >= self.policy.max_attempts {
                    error!(
                        "Dead-lettering mail to {} after {} attempt(s): {}",
                        job.to, attempt, e
                    );
                    self.queue.dead_letter(&delivery).await?;
                    return Ok(Outcome::DeadLettered);
                }
                warn!(
                    "Mail to {} failed (attempt {}/{}), will retry: {}",
                    job.to, attempt, self.policy.max_attempts, e
                );
                self.queue.nack(&delivery).await?;
                Ok(Outcome::Retried)
            }
        }
    }
}
