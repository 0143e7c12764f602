//! Mail dispatch worker: drains the `send-otp` queue one job at a time and
//! hands each job to a mail transport.

pub mod config;
pub mod transport;
pub mod worker;

pub use config::MailerConfig;
pub use transport::{HttpMailTransport, LogTransport, MailError, MailTransport};
pub use worker::{MailWorker, Outcome, RetryPolicy};
