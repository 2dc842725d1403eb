use std::time::Duration;
use thiserror::Error;

use ion_queue::QueueError;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Backend returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Queue closed, no more messages will be received")]
    QueueClosed,
}

impl DispatchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DispatchError::Http { status: 404, .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, DispatchError::Http { status: 409, .. })
    }
}
