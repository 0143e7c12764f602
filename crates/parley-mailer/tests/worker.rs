use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{Json, Router, http::HeaderMap, routing::post};
use serde_json::Value;
use tokio::sync::watch;

use parley_mailer::{
    HttpMailTransport, MailError, MailTransport, MailWorker, Outcome, RetryPolicy,
};
use parley_queue::{MemoryWorkQueue, WorkQueue, publish_json};
use parley_types::BoxFuture;
use parley_types::jobs::{MailJob, OTP_QUEUE};

/// Records every job; fails the first `fail_first` sends.
#[derive(Default)]
struct FakeTransport {
    sent: Mutex<Vec<MailJob>>,
    fail_first: Mutex<u32>,
}

impl FakeTransport {
    fn failing(times: u32) -> Self {
        Self {
            sent: Mutex::default(),
            fail_first: Mutex::new(times),
        }
    }

    fn sent(&self) -> Vec<MailJob> {
        self.sent.lock().unwrap().clone()
    }
}

impl MailTransport for FakeTransport {
    fn send<'a>(&'a self, job: &'a MailJob) -> BoxFuture<'a, Result<(), MailError>> {
        Box::pin(async move {
            {
                let mut remaining = self.fail_first.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(MailError::Transport("connection reset".into()));
                }
            }
            self.sent.lock().unwrap().push(job.clone());
            Ok(())
        })
    }
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        poll_timeout: Duration::from_millis(20),
        base_backoff_ms: 10,
        max_backoff_ms: 50,
        max_attempts: 3,
    }
}

fn worker(queue: &MemoryWorkQueue, transport: &Arc<FakeTransport>) -> MailWorker {
    MailWorker::new(Arc::new(queue.clone()), transport.clone()).with_policy(fast_policy())
}

#[tokio::test]
async fn sent_job_is_acked() {
    let queue = MemoryWorkQueue::new();
    let transport = Arc::new(FakeTransport::default());
    let job = MailJob::otp("a@x.com", "123456", 5);
    publish_json(&queue, OTP_QUEUE, &job).await.unwrap();

    let w = worker(&queue, &transport);
    assert_eq!(w.process_next().await.unwrap(), Outcome::Sent);
    assert_eq!(transport.sent(), vec![job]);
    assert_eq!(queue.in_flight(OTP_QUEUE).await, 0);
    assert!(queue.ready(OTP_QUEUE).await.is_empty());

    assert_eq!(w.process_next().await.unwrap(), Outcome::Idle);
}

#[tokio::test]
async fn malformed_payload_is_dead_lettered() {
    let queue = MemoryWorkQueue::new();
    let transport = Arc::new(FakeTransport::default());
    queue.publish(OTP_QUEUE, "{\"to\":").await.unwrap();

    let w = worker(&queue, &transport);
    assert_eq!(w.process_next().await.unwrap(), Outcome::DeadLettered);
    assert_eq!(queue.dead_letters(OTP_QUEUE).await, vec!["{\"to\":".to_string()]);
    assert_eq!(queue.in_flight(OTP_QUEUE).await, 0);
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn failed_send_is_requeued_then_delivered() {
    let queue = MemoryWorkQueue::new();
    let transport = Arc::new(FakeTransport::failing(1));
    publish_json(&queue, OTP_QUEUE, &MailJob::otp("a@x.com", "654321", 5))
        .await
        .unwrap();

    let w = worker(&queue, &transport);
    assert_eq!(w.process_next().await.unwrap(), Outcome::Retried);
    assert_eq!(queue.ready(OTP_QUEUE).await.len(), 1);
    assert_eq!(queue.in_flight(OTP_QUEUE).await, 0);

    assert_eq!(w.process_next().await.unwrap(), Outcome::Sent);
    assert_eq!(transport.sent().len(), 1);
}

/// Fails every send to one address with the given relay status.
struct RejectingTransport {
    bad_to: &'static str,
    status: u16,
    sent: Mutex<Vec<MailJob>>,
}

impl RejectingTransport {
    fn new(bad_to: &'static str, status: u16) -> Self {
        Self {
            bad_to,
            status,
            sent: Mutex::default(),
        }
    }
}

impl MailTransport for RejectingTransport {
    fn send<'a>(&'a self, job: &'a MailJob) -> BoxFuture<'a, Result<(), MailError>> {
        Box::pin(async move {
            if job.to == self.bad_to {
                return Err(MailError::Rejected {
                    status: self.status,
                    body: "no".into(),
                });
            }
            self.sent.lock().unwrap().push(job.clone());
            Ok(())
        })
    }
}

#[tokio::test]
async fn rejected_recipient_does_not_block_later_jobs() {
    let queue = MemoryWorkQueue::new();
    let transport = Arc::new(RejectingTransport::new("bad@x.com", 400));
    publish_json(&queue, OTP_QUEUE, &MailJob::otp("bad@x.com", "111111", 5))
        .await
        .unwrap();
    publish_json(&queue, OTP_QUEUE, &MailJob::otp("good@x.com", "222222", 5))
        .await
        .unwrap();

    let w = MailWorker::new(Arc::new(queue.clone()), transport.clone()).with_policy(fast_policy());
    assert_eq!(w.process_next().await.unwrap(), Outcome::DeadLettered);
    assert_eq!(w.process_next().await.unwrap(), Outcome::Sent);
    assert_eq!(w.process_next().await.unwrap(), Outcome::Idle);

    assert_eq!(transport.sent.lock().unwrap()[0].to, "good@x.com");
    assert_eq!(queue.dead_letters(OTP_QUEUE).await.len(), 1);
    assert_eq!(queue.in_flight(OTP_QUEUE).await, 0);
}

#[tokio::test]
async fn failing_job_is_retried_behind_others_then_dead_lettered() {
    let queue = MemoryWorkQueue::new();
    let transport = Arc::new(RejectingTransport::new("down@x.com", 503));
    publish_json(&queue, OTP_QUEUE, &MailJob::otp("down@x.com", "111111", 5))
        .await
        .unwrap();
    publish_json(&queue, OTP_QUEUE, &MailJob::otp("good@x.com", "222222", 5))
        .await
        .unwrap();

    let w = MailWorker::new(Arc::new(queue.clone()), transport.clone()).with_policy(fast_policy());
    let mut outcomes = Vec::new();
    for _ in 0..5 {
        outcomes.push(w.process_next().await.unwrap());
    }

    assert_eq!(
        outcomes,
        vec![
            Outcome::Retried,
            Outcome::Sent,
            Outcome::Retried,
            Outcome::DeadLettered,
            Outcome::Idle,
        ]
    );
    assert_eq!(transport.sent.lock().unwrap().len(), 1);
    assert_eq!(queue.dead_letters(OTP_QUEUE).await.len(), 1);
    assert!(queue.ready(OTP_QUEUE).await.is_empty());
}

#[test]
fn relay_client_errors_are_permanent() {
    let rejected = |status| MailError::Rejected {
        status,
        body: String::new(),
    };
    assert!(rejected(400).is_permanent());
    assert!(rejected(404).is_permanent());
    assert!(!rejected(429).is_permanent());
    assert!(!rejected(503).is_permanent());
    assert!(!MailError::Transport("reset".into()).is_permanent());
}

#[tokio::test]
async fn run_recovers_jobs_left_in_flight_and_stops_on_shutdown() {
    let queue = MemoryWorkQueue::new();
    publish_json(&queue, OTP_QUEUE, &MailJob::otp("crash@x.com", "111111", 5))
        .await
        .unwrap();
    // A previous consumer took the job and died before settling it.
    let orphan = queue.consume(OTP_QUEUE, Duration::from_millis(10)).await.unwrap();
    assert!(orphan.is_some());
    assert_eq!(queue.in_flight(OTP_QUEUE).await, 1);

    let transport = Arc::new(FakeTransport::failing(2));
    let w = worker(&queue, &transport);
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move { w.run(rx).await });

    tokio::time::timeout(Duration::from_secs(5), async {
        while transport.sent().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("job delivered after retries");

    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
    assert_eq!(transport.sent()[0].to, "crash@x.com");
    assert_eq!(queue.in_flight(OTP_QUEUE).await, 0);
}

#[tokio::test]
async fn http_transport_posts_to_relay_with_key() {
    let seen: Arc<Mutex<Vec<(Option<String>, Value)>>> = Arc::default();
    let captured = seen.clone();
    let app = Router::new().route(
        "/send",
        post(move |headers: HeaderMap, Json(body): Json<Value>| {
            let captured = captured.clone();
            async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                captured.lock().unwrap().push((auth, body));
                "ok"
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let transport = HttpMailTransport::new(
        format!("http://{addr}/send"),
        Some("relay-key".into()),
        "Parley <no-reply@parley.local>",
    )
    .unwrap();
    transport
        .send(&MailJob::otp("a@x.com", "222222", 5))
        .await
        .unwrap();

    let calls = seen.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0.as_deref(), Some("Bearer relay-key"));
    assert_eq!(calls[0].1["to"], "a@x.com");
    assert_eq!(calls[0].1["subject"], "Your OTP is");
    assert_eq!(calls[0].1["text"], "Your OTP is 222222, valid for 5 minutes");

    let missing = HttpMailTransport::new(format!("http://{addr}/nope"), None, "x").unwrap();
    let err = missing.send(&MailJob::otp("a@x.com", "1", 5)).await.unwrap_err();
    assert!(matches!(err, MailError::Rejected { status: 404, .. }));
}
