//! Error types for the A2A relay.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A required field was missing or malformed. Raised before any side effect.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    UnknownTask(String),

    #[error("Task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    /// An optimistic write lost against a concurrent change.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The relay could not be reached or rejected the request.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The relay answered with a client error other than validation.
    #[error("Relay rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Notification error: {0}")]
    Notification(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn store(context: &str, err: impl std::fmt::Display) -> Self {
        Error::Store(format!("{}: {}", context, err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}
