use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// No usable session: never signed in, or the refresh token was rejected.
    #[error("please sign in")]
    SignedOut,
    #[error("{message} ({status} {code})")]
    Api {
        status: u16,
        code: String,
        message: String,
    },
    #[error("network error: {0}")]
    Transport(String),
    #[error("realtime connection error: {0}")]
    Realtime(String),
    #[error("token storage error: {0}")]
    Storage(String),
}

impl ClientError {
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Realtime(err.to_string())
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
