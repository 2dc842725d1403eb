use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to decode message payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Message {0} was already accepted or rejected")]
    AlreadySettled(String),

    #[error("Settlement of message {0} failed")]
    SettleFailed(String),

    #[error("AMQP error: {0}")]
    Amqp(String),

    #[error("Queue is closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(String),
}

#[cfg(feature = "amqp")]
impl From<lapin::Error> for QueueError {
    fn from(e: lapin::Error) -> Self {
        QueueError::Amqp(e.to_string())
    }
}
