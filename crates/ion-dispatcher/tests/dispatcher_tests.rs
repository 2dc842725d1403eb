//! Dispatcher Run Loop Tests
//!
//! Tests for:
//! - Retry budget enforcement
//! - Dispatch errors not stopping ingestion
//! - Queue close and reconcile failures ending the run
//! - Provider selection

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ion_config::{AppConfig, AzureBatchConfig};
use ion_dispatcher::{
    select_provider, DispatchError, Dispatcher, DispatcherConfig, MessageOutcome, Provider,
};
use ion_queue::{InMemoryQueue, QueueMessage, QueueReceiver};

const EVENT_BODY: &str = r#"{"context": {"eventId": "e1", "correlationId": "c1"}, "type": "t", "data": []}"#;

#[derive(Default)]
struct RecordingProvider {
    dispatched: Mutex<Vec<(String, u32)>>,
    fail_dispatch: AtomicBool,
    fail_reconcile: AtomicBool,
    slow_reconcile: AtomicBool,
    reconciles: AtomicUsize,
}

#[async_trait]
impl Provider for RecordingProvider {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn dispatch(&self, message: Arc<dyn QueueMessage>) -> ion_dispatcher::Result<()> {
        if self.fail_dispatch.load(Ordering::SeqCst) {
            message.reject().await?;
            return Err(DispatchError::Backend("no capacity".to_string()));
        }
        self.dispatched
            .lock()
            .push((message.id().to_string(), message.delivery_count()));
        Ok(())
    }

    fn in_progress_count(&self) -> usize {
        self.dispatched.lock().len()
    }

    async fn reconcile(&self) -> ion_dispatcher::Result<()> {
        self.reconciles.fetch_add(1, Ordering::SeqCst);
        if self.slow_reconcile.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        if self.fail_reconcile.load(Ordering::SeqCst) {
            return Err(DispatchError::Http {
                status: 500,
                body: "list failed".to_string(),
            });
        }
        Ok(())
    }

    fn active_messages(&self) -> Vec<Arc<dyn QueueMessage>> {
        Vec::new()
    }
}

fn dispatcher_config(retry_count: u32) -> DispatcherConfig {
    DispatcherConfig {
        retry_count,
        reconcile_interval: Duration::from_millis(10),
        reconcile_timeout: Duration::from_millis(200),
    }
}

fn setup(retry_count: u32) -> (Arc<InMemoryQueue>, Arc<RecordingProvider>, Dispatcher) {
    let queue = Arc::new(InMemoryQueue::new("file_downloaded.transcode"));
    let provider = Arc::new(RecordingProvider::default());
    let dispatcher = Dispatcher::new(
        queue.clone(),
        provider.clone(),
        dispatcher_config(retry_count),
    );
    (queue, provider, dispatcher)
}

#[tokio::test]
async fn test_over_budget_rejected_without_dispatch() {
    let (queue, provider, dispatcher) = setup(1);
    queue.publish_with_delivery_count("M1", EVENT_BODY, 3);

    let message = queue.receive().await.unwrap().unwrap();
    let outcome = dispatcher.handle_message(message).await.unwrap();

    assert_eq!(outcome, MessageOutcome::RejectedOverBudget);
    assert!(provider.dispatched.lock().is_empty());
    assert_eq!(queue.rejected(), vec!["M1".to_string()]);
}

#[tokio::test]
async fn test_budget_boundary_is_dispatched() {
    let (queue, provider, dispatcher) = setup(1);
    queue.publish_with_delivery_count("M1", EVENT_BODY, 2);

    let message = queue.receive().await.unwrap().unwrap();
    let outcome = dispatcher.handle_message(message).await.unwrap();

    assert_eq!(outcome, MessageOutcome::Dispatched);
    assert_eq!(*provider.dispatched.lock(), vec![("M1".to_string(), 2)]);
}

#[tokio::test]
async fn test_dispatch_error_is_not_fatal() {
    let (queue, provider, dispatcher) = setup(0);
    provider.fail_dispatch.store(true, Ordering::SeqCst);
    queue.publish("M1", EVENT_BODY);

    let message = queue.receive().await.unwrap().unwrap();
    let outcome = dispatcher.handle_message(message).await.unwrap();

    assert_eq!(outcome, MessageOutcome::DispatchFailed);
    assert_eq!(queue.rejected(), vec!["M1".to_string()]);
}

#[tokio::test]
async fn test_ingestion_ends_when_queue_closes() {
    let (queue, provider, dispatcher) = setup(0);
    queue.publish("M1", EVENT_BODY);
    queue.publish("M2", EVENT_BODY);
    queue.close();

    let result = dispatcher.run_ingestion().await;

    assert!(matches!(result, Err(DispatchError::QueueClosed)));
    let ids: Vec<String> = provider
        .dispatched
        .lock()
        .iter()
        .map(|(id, _)| id.clone())
        .collect();
    assert_eq!(ids, vec!["M1".to_string(), "M2".to_string()]);
}

#[tokio::test]
async fn test_retries_stop_at_budget() {
    let (queue, provider, dispatcher) = setup(1);
    provider.fail_dispatch.store(true, Ordering::SeqCst);
    queue.publish("M1", EVENT_BODY);

    // deliveries 0, 1 and 2 reach the provider; 3 is over budget
    for _ in 0..4 {
        let message = queue.receive().await.unwrap().unwrap();
        dispatcher.handle_message(message).await.unwrap();
    }

    assert_eq!(queue.rejected().len(), 4);
    assert_eq!(queue.pending_len(), 1);
}

#[tokio::test]
async fn test_reconcile_failure_ends_run() {
    let (queue, provider, dispatcher) = setup(0);
    provider.fail_reconcile.store(true, Ordering::SeqCst);

    let result = tokio::time::timeout(Duration::from_secs(5), dispatcher.run())
        .await
        .expect("run should stop on reconcile failure");

    assert!(matches!(result, Err(DispatchError::Http { status: 500, .. })));
    assert_eq!(queue.pending_len(), 0);
}

#[tokio::test]
async fn test_reconcile_pass_is_bounded() {
    let (_queue, provider, dispatcher) = setup(0);
    provider.slow_reconcile.store(true, Ordering::SeqCst);

    let result = dispatcher.reconcile_once().await;

    assert!(matches!(result, Err(DispatchError::Timeout(_))));
}

#[tokio::test]
async fn test_reconcile_runs_repeatedly() {
    let (_queue, provider, dispatcher) = setup(0);

    let _ = tokio::time::timeout(Duration::from_millis(100), dispatcher.run_reconciliation()).await;

    assert!(provider.reconciles.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_select_provider() {
    let mut config = AppConfig::default();
    config.kubernetes.api_server = "http://127.0.0.1:6443".to_string();
    let provider = select_provider(&config).unwrap();
    assert_eq!(provider.name(), "kubernetes");

    config.azure_batch = Some(AzureBatchConfig {
        pool_id: "pool-1".to_string(),
        batch_url: "https://acct.westeurope.batch.azure.com".to_string(),
        ..Default::default()
    });
    let provider = select_provider(&config).unwrap();
    assert_eq!(provider.name(), "azurebatch");
    assert_eq!(provider.in_progress_count(), 0);
}
