use async_trait::async_trait;
use ion_common::Event;
use std::sync::Arc;

pub mod error;
pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use error::QueueError;
pub use memory::{InMemoryMessage, InMemoryQueue};

pub type Result<T> = std::result::Result<T, QueueError>;

/// Approximate queue depth, reported by the run loop after each ingestion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    /// Messages waiting to be delivered
    pub active: u64,
    /// Messages moved to the dead-letter queue
    pub dead_lettered: u64,
}

/// A message received from the queue.
///
/// A message is settled at most once per delivery: after `accept`, `reject`
/// or `dead_letter` succeeds, further settlement calls return
/// [`QueueError::AlreadySettled`].
#[async_trait]
pub trait QueueMessage: Send + Sync {
    /// Identity of the message, stable across redeliveries
    fn id(&self) -> &str;

    /// Number of previous deliveries of this message (0 on first delivery)
    fn delivery_count(&self) -> u32;

    /// Raw payload
    fn body(&self) -> &[u8];

    /// Decode the payload as an event envelope
    fn event_data(&self) -> Result<Event> {
        Ok(Event::from_json(self.body())?)
    }

    /// Remove the message from the queue permanently
    async fn accept(&self) -> Result<()>;

    /// Release the message for redelivery. Once the queue's delivery limit is
    /// exceeded the queue dead-letters it instead.
    async fn reject(&self) -> Result<()>;

    /// Move the message straight to the dead-letter queue.
    /// Receivers without a dead-letter primitive fall back to `reject`.
    async fn dead_letter(&self) -> Result<()> {
        self.reject().await
    }
}

/// Source of queue messages
#[async_trait]
pub trait QueueReceiver: Send + Sync {
    /// Identifier of the underlying queue
    fn identifier(&self) -> &str;

    /// Block until the next message arrives.
    /// Returns `None` once the queue has been closed and will yield nothing more.
    async fn receive(&self) -> Result<Option<Arc<dyn QueueMessage>>>;

    /// Current depth of the queue, if the transport can report it
    async fn queue_depth(&self) -> Result<Option<QueueDepth>> {
        Ok(None)
    }

    /// Renew locks held on messages still being processed.
    /// Transports where a delivery stays owned until settled do nothing.
    async fn extend_locks(&self, _messages: &[Arc<dyn QueueMessage>]) -> Result<()> {
        Ok(())
    }

    /// Stop receiving and release the connection
    async fn stop(&self);
}
