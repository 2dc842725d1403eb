//! Correlation between dispatched messages and their backend units

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use ion_queue::QueueMessage;
use std::sync::Arc;
use tracing::warn;

/// One dispatched delivery awaiting a terminal backend state
#[derive(Clone)]
pub struct InFlightEntry {
    /// Backend job/task identity of this attempt
    pub backend_id: String,
    pub message: Arc<dyn QueueMessage>,
    pub dispatched_at: DateTime<Utc>,
}

/// Correlation table keyed by a per-message key (the message ID as the
/// backend can carry it).
///
/// Only the latest attempt of a message is tracked. A backend unit whose
/// identity differs from the tracked attempt never settles the message.
#[derive(Default)]
pub struct InFlightTable {
    entries: DashMap<String, InFlightEntry>,
}

impl InFlightTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: String, backend_id: String, message: Arc<dyn QueueMessage>) {
        let entry = InFlightEntry {
            backend_id,
            message,
            dispatched_at: Utc::now(),
        };
        if let Some(previous) = self.entries.insert(key.clone(), entry) {
            warn!(
                message_key = %key,
                previous_backend_id = %previous.backend_id,
                "Replacing in-flight attempt for redelivered message"
            );
        }
    }

    /// Entry for `key`, only if it tracks the attempt `backend_id`
    pub fn get_attempt(&self, key: &str, backend_id: &str) -> Option<InFlightEntry> {
        self.entries
            .get(key)
            .filter(|entry| entry.backend_id == backend_id)
            .map(|entry| entry.value().clone())
    }

    /// Remove the entry for `key` if it still tracks `backend_id`
    pub fn remove_attempt(&self, key: &str, backend_id: &str) -> Option<InFlightEntry> {
        self.entries
            .remove_if(key, |_, entry| entry.backend_id == backend_id)
            .map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn messages(&self) -> Vec<Arc<dyn QueueMessage>> {
        self.entries
            .iter()
            .map(|entry| Arc::clone(&entry.message))
            .collect()
    }
}

/// Backend units whose delete failed after the message was settled.
/// Retried on every reconcile until the backend confirms they are gone.
#[derive(Default)]
pub struct PendingDeletes {
    ids: DashSet<String>,
}

impl PendingDeletes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, backend_id: impl Into<String>) {
        self.ids.insert(backend_id.into());
    }

    pub fn remove(&self, backend_id: &str) {
        self.ids.remove(backend_id);
    }

    pub fn contains(&self, backend_id: &str) -> bool {
        self.ids.contains(backend_id)
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.ids.iter().map(|id| id.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ion_queue::{InMemoryQueue, QueueReceiver};

    async fn message(queue: &InMemoryQueue, id: &str) -> Arc<dyn QueueMessage> {
        queue.publish(id, &b"{}"[..]);
        queue.receive().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_stale_attempt_does_not_match() {
        let queue = InMemoryQueue::new("q");
        let table = InFlightTable::new();
        table.insert("m1".to_string(), "m1-v1".to_string(), message(&queue, "m1").await);

        assert!(table.get_attempt("m1", "m1-v0").is_none());
        assert!(table.remove_attempt("m1", "m1-v0").is_none());
        assert_eq!(table.len(), 1);

        let entry = table.remove_attempt("m1", "m1-v1").unwrap();
        assert_eq!(entry.backend_id, "m1-v1");
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_redelivery_replaces_attempt() {
        let queue = InMemoryQueue::new("q");
        let table = InFlightTable::new();
        table.insert("m1".to_string(), "m1-v0".to_string(), message(&queue, "m1").await);
        table.insert("m1".to_string(), "m1-v1".to_string(), message(&queue, "m1").await);

        assert_eq!(table.len(), 1);
        assert!(table.get_attempt("m1", "m1-v1").is_some());
        assert_eq!(table.messages().len(), 1);
    }

    #[test]
    fn test_pending_deletes() {
        let pending = PendingDeletes::new();
        pending.insert("job-a");
        pending.insert("job-a");
        assert_eq!(pending.len(), 1);
        assert!(pending.contains("job-a"));

        pending.remove("job-a");
        assert!(pending.is_empty());
    }
}
