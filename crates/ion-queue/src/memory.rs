//! In-process queue
//!
//! Used for local development (`queue.type = "memory"`) and as the queue in
//! dispatcher tests. Rejected messages are redelivered with an incremented
//! delivery count until `max_deliveries` is exceeded, after which they are
//! dead-lettered, mirroring a broker with a delivery limit.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

use crate::{QueueDepth, QueueError, QueueMessage, QueueReceiver, Result};

#[derive(Debug, Clone)]
struct Pending {
    id: String,
    body: Vec<u8>,
    delivery_count: u32,
}

#[derive(Default)]
struct State {
    pending: VecDeque<Pending>,
    accepted: Vec<String>,
    rejected: Vec<String>,
    dead_lettered: Vec<String>,
    closed: bool,
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
    max_deliveries: Option<u32>,
    /// Settlements still to fail, for exercising broker errors
    settle_failures: AtomicUsize,
}

impl Shared {
    fn take_settle_failure(&self) -> bool {
        self.settle_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn requeue_or_dead_letter(&self, message: &InMemoryMessage) {
        let next_count = message.delivery_count + 1;
        let mut state = self.state.lock();
        state.rejected.push(message.id.clone());

        match self.max_deliveries {
            Some(max) if next_count > max => {
                debug!(message_id = %message.id, delivery_count = next_count, "Delivery limit exceeded, dead-lettering");
                state.dead_lettered.push(message.id.clone());
            }
            _ => {
                state.pending.push_back(Pending {
                    id: message.id.clone(),
                    body: message.body.clone(),
                    delivery_count: next_count,
                });
                drop(state);
                self.notify.notify_one();
            }
        }
    }
}

/// In-memory queue implementing [`QueueReceiver`]
pub struct InMemoryQueue {
    name: String,
    shared: Arc<Shared>,
}

impl InMemoryQueue {
    /// Queue without a delivery limit: rejected messages are redelivered forever
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), None)
    }

    /// Queue that dead-letters a message once its delivery count would exceed `max_deliveries`
    pub fn with_max_deliveries(name: impl Into<String>, max_deliveries: u32) -> Self {
        Self::build(name.into(), Some(max_deliveries))
    }

    fn build(name: String, max_deliveries: Option<u32>) -> Self {
        Self {
            name,
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                max_deliveries,
                settle_failures: AtomicUsize::new(0),
            }),
        }
    }

    /// Enqueue a new message
    pub fn publish(&self, id: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.publish_with_delivery_count(id, body, 0);
    }

    /// Enqueue a message as if it had already been delivered `delivery_count` times
    pub fn publish_with_delivery_count(
        &self,
        id: impl Into<String>,
        body: impl Into<Vec<u8>>,
        delivery_count: u32,
    ) {
        self.shared.state.lock().pending.push_back(Pending {
            id: id.into(),
            body: body.into(),
            delivery_count,
        });
        self.shared.notify.notify_one();
    }

    /// Stop delivering. Pending messages are still drained before `receive` returns `None`.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.notify.notify_waiters();
    }

    /// IDs of accepted messages, in settlement order
    pub fn accepted(&self) -> Vec<String> {
        self.shared.state.lock().accepted.clone()
    }

    /// IDs of rejected messages, one entry per rejection
    pub fn rejected(&self) -> Vec<String> {
        self.shared.state.lock().rejected.clone()
    }

    /// IDs of dead-lettered messages
    pub fn dead_lettered(&self) -> Vec<String> {
        self.shared.state.lock().dead_lettered.clone()
    }

    /// Make the next `count` accept/reject/dead-letter calls fail as a broker
    /// error would, leaving the message unsettled
    pub fn fail_next_settlements(&self, count: usize) {
        self.shared.settle_failures.store(count, Ordering::SeqCst);
    }

    /// Number of messages waiting to be received
    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }
}

#[async_trait]
impl QueueReceiver for InMemoryQueue {
    fn identifier(&self) -> &str {
        &self.name
    }

    async fn receive(&self) -> Result<Option<Arc<dyn QueueMessage>>> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock();
                if let Some(pending) = state.pending.pop_front() {
                    let message = InMemoryMessage {
                        id: pending.id,
                        body: pending.body,
                        delivery_count: pending.delivery_count,
                        settled: AtomicBool::new(false),
                        queue: Arc::clone(&self.shared),
                    };
                    return Ok(Some(Arc::new(message)));
                }
                if state.closed {
                    return Ok(None);
                }
            }
            notified.await;
        }
    }

    async fn queue_depth(&self) -> Result<Option<QueueDepth>> {
        let state = self.shared.state.lock();
        Ok(Some(QueueDepth {
            active: state.pending.len() as u64,
            dead_lettered: state.dead_lettered.len() as u64,
        }))
    }

    async fn stop(&self) {
        self.close();
    }
}

/// A delivery from an [`InMemoryQueue`]
pub struct InMemoryMessage {
    id: String,
    body: Vec<u8>,
    delivery_count: u32,
    settled: AtomicBool,
    queue: Arc<Shared>,
}

impl InMemoryMessage {
    fn settle(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(QueueError::AlreadySettled(self.id.clone()));
        }
        if self.queue.take_settle_failure() {
            self.settled.store(false, Ordering::SeqCst);
            return Err(QueueError::SettleFailed(self.id.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueMessage for InMemoryMessage {
    fn id(&self) -> &str {
        &self.id
    }

    fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    fn body(&self) -> &[u8] {
        &self.body
    }

    async fn accept(&self) -> Result<()> {
        self.settle()?;
        self.queue.state.lock().accepted.push(self.id.clone());
        Ok(())
    }

    async fn reject(&self) -> Result<()> {
        self.settle()?;
        self.queue.requeue_or_dead_letter(self);
        Ok(())
    }

    async fn dead_letter(&self) -> Result<()> {
        self.settle()?;
        self.queue.state.lock().dead_lettered.push(self.id.clone());
        Ok(())
    }
}
