use std::time::Duration;

use parley_types::BoxFuture;
use parley_types::jobs::MailJob;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail relay unreachable: {0}")]
    Transport(String),
    #[error("mail relay rejected the message ({status}): {body}")]
    Rejected { status: u16, body: String },
}

impl MailError {
    /// A relay 4xx other than timeout or throttling will not succeed on retry.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Transport(_) => false,
            Self::Rejected { status, .. } => {
                (400..500).contains(status) && *status != 408 && *status != 429
            }
        }
    }
}

pub trait MailTransport: Send + Sync {
    fn send<'a>(&'a self, job: &'a MailJob) -> BoxFuture<'a, Result<(), MailError>>;
}

#[derive(Serialize)]
struct RelayRequest<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    text: &'a str,
}

/// Posts each job as JSON to an HTTP mail relay.
pub struct HttpMailTransport {
    client: reqwest::Client,
    relay_url: String,
    api_key: Option<String>,
    from: String,
}

impl HttpMailTransport {
    pub fn new(
        relay_url: impl Into<String>,
        api_key: Option<String>,
        from: impl Into<String>,
    ) -> Result<Self, MailError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| MailError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            relay_url: relay_url.into(),
            api_key,
            from: from.into(),
        })
    }
}

impl MailTransport for HttpMailTransport {
    fn send<'a>(&'a self, job: &'a MailJob) -> BoxFuture<'a, Result<(), MailError>> {
        Box::pin(async move {
            let mut request = self.client.post(&self.relay_url).json(&RelayRequest {
                from: &self.from,
                to: &job.to,
                subject: &job.subject,
                text: &job.body,
            });
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            let resp = request
                .send()
                .await
                .map_err(|e| MailError::Transport(e.to_string()))?;
            let status = resp.status();
            if status.is_success() {
                return Ok(());
            }
            let body = resp.text().await.unwrap_or_default();
            Err(MailError::Rejected {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            })
        })
    }
}

/// Development transport: writes the mail to the log instead of sending it.
pub struct LogTransport;

impl MailTransport for LogTransport {
    fn send<'a>(&'a self, job: &'a MailJob) -> BoxFuture<'a, Result<(), MailError>> {
        Box::pin(async move {
            info!("[mail] to={} subject={:?} body={:?}", job.to, job.subject, job.body);
            Ok(())
        })
    }
}
