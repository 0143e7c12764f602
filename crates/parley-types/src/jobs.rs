use serde::{Deserialize, Serialize};

/// Durable queue carrying OTP mail jobs.
pub const OTP_QUEUE: &str = "send-otp";

/// Payload published onto [`OTP_QUEUE`], JSON-serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailJob {
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl MailJob {
    pub fn otp(to: &str, code: &str, ttl_minutes: u64) -> Self {
        Self {
            to: to.to_string(),
            subject: "Your OTP is".to_string(),
            body: format!("Your OTP is {code}, valid for {ttl_minutes} minutes"),
        }
    }
}
