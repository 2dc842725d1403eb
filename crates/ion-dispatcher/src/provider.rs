//! Provider - boundary between dispatch policy and a compute backend

use async_trait::async_trait;
use ion_common::Event;
use ion_queue::QueueMessage;
use std::sync::Arc;
use tracing::{error, warn};

use crate::{DispatchError, Result};

/// A compute backend that runs one module execution per queue message.
///
/// Implementations own their correlation table; nothing outside the provider
/// reads or mutates it.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short backend name used in logs
    fn name(&self) -> &'static str;

    /// Schedule exactly one backend unit for the message and record the
    /// correlation. When scheduling fails the message has already been
    /// rejected (or dead-lettered) by the time the error is returned.
    async fn dispatch(&self, message: Arc<dyn QueueMessage>) -> Result<()>;

    /// Number of dispatched messages awaiting a terminal backend state
    fn in_progress_count(&self) -> usize;

    /// Sync backend state into accept/reject decisions. Idempotent.
    async fn reconcile(&self) -> Result<()>;

    /// Messages currently awaiting a terminal backend state
    fn active_messages(&self) -> Vec<Arc<dyn QueueMessage>>;
}

/// Decode the envelope of a message about to be dispatched.
///
/// A payload that cannot be decoded will never succeed on redelivery, so the
/// message is dead-lettered before the decode error is returned.
pub(crate) async fn decode_or_dead_letter(message: &dyn QueueMessage) -> Result<Event> {
    match message.event_data() {
        Ok(event) => Ok(event),
        Err(e) => {
            warn!(
                message_id = %message.id(),
                delivery_count = message.delivery_count(),
                error = %e,
                "Malformed message payload, dead-lettering"
            );
            if let Err(settle_err) = message.dead_letter().await {
                error!(message_id = %message.id(), error = %settle_err, "Failed to dead-letter message");
            }
            Err(DispatchError::Queue(e))
        }
    }
}

/// Reject a message whose backend unit could not be created, then hand the
/// scheduling error back to the caller.
pub(crate) async fn reject_after_failure(
    message: &dyn QueueMessage,
    cause: DispatchError,
) -> DispatchError {
    error!(
        message_id = %message.id(),
        delivery_count = message.delivery_count(),
        error = %cause,
        "Failed to schedule backend unit, rejecting message"
    );
    if let Err(e) = message.reject().await {
        error!(message_id = %message.id(), error = %e, "Failed to reject message");
    }
    cause
}
