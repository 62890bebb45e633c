use reqwest::StatusCode;
use std::fmt;
use thiserror::Error;

/// Queue stage that produced a remote `success:false`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Lookup,
    Enrollment,
    Status,
    Claim,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Lookup => "lookup",
            Stage::Enrollment => "enrollment",
            Stage::Status => "status",
            Stage::Claim => "claim",
        };
        f.write_str(label)
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("broker transport failed: {0}")]
    Transport(String),
    #[error("{stage} rejected by server: {message}")]
    RemoteRejected { stage: Stage, message: String },
    #[error("island {0} has either spoiled or was not found")]
    NotFound(String),
    #[error("network error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("gave up after {attempts} status polls")]
    PollLimitReached { attempts: u64 },
    #[error("queue deadline elapsed before reaching the front")]
    DeadlineElapsed,
    #[error("run cancelled")]
    Cancelled,
}

impl QueueError {
    pub(crate) fn rejected(stage: Stage, message: Option<String>) -> Self {
        QueueError::RemoteRejected {
            stage,
            message: message.unwrap_or_else(|| "no message".to_string()),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for QueueError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        QueueError::Transport(value.to_string())
    }
}
