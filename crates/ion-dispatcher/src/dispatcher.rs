//! Run loop
//!
//! Owns the queue receiver and the single provider, and runs two activities
//! for the life of the process:
//! - ingestion: receive → retry-budget check → `Provider::dispatch`
//! - reconciliation: `Provider::reconcile` on a fixed interval
//!
//! Either activity returning an error ends the run; recovery is a process
//! restart by the supervisor.

use ion_config::AppConfig;
use ion_queue::{QueueMessage, QueueReceiver};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::azure_batch::AzureBatchProvider;
use crate::kubernetes::KubernetesProvider;
use crate::provider::Provider;
use crate::{DispatchError, Result};

/// Run loop settings
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Failed attempts retried before a message is dropped
    pub retry_count: u32,
    pub reconcile_interval: Duration,
    pub reconcile_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry_count: 0,
            reconcile_interval: Duration::from_secs(15),
            reconcile_timeout: Duration::from_secs(300),
        }
    }
}

impl From<&AppConfig> for DispatcherConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            retry_count: config.job.retry_count,
            reconcile_interval: Duration::from_secs(config.dispatcher.reconcile_interval_secs),
            reconcile_timeout: Duration::from_secs(config.dispatcher.reconcile_timeout_secs),
        }
    }
}

/// What ingestion did with one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// A backend unit was created and is tracked until reconcile settles it
    Dispatched,
    /// The delivery count exceeded the retry budget; rejected without dispatching
    RejectedOverBudget,
    /// The provider failed to schedule it and has already rejected it
    DispatchFailed,
}

/// Pick the provider for this process: Azure Batch when configured, else Kubernetes
pub fn select_provider(config: &AppConfig) -> Result<Arc<dyn Provider>> {
    let provider: Arc<dyn Provider> = if config.azure_batch.is_some() {
        Arc::new(AzureBatchProvider::from_config(config)?)
    } else {
        Arc::new(KubernetesProvider::from_config(config)?)
    };
    info!(provider = provider.name(), "Provider selected");
    Ok(provider)
}

pub struct Dispatcher {
    receiver: Arc<dyn QueueReceiver>,
    provider: Arc<dyn Provider>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        receiver: Arc<dyn QueueReceiver>,
        provider: Arc<dyn Provider>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            receiver,
            provider,
            config,
        }
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Deliveries beyond the first `retry_count + 1` are never dispatched
    fn over_budget(&self, message: &dyn QueueMessage) -> bool {
        message.delivery_count() > self.config.retry_count.saturating_add(1)
    }

    /// Apply the retry budget and dispatch one message
    pub async fn handle_message(&self, message: Arc<dyn QueueMessage>) -> Result<MessageOutcome> {
        let context = message
            .event_data()
            .map(|event| event.context_or_default())
            .unwrap_or_default();
        let span = info_span!(
            "message",
            message_id = %message.id(),
            delivery_count = message.delivery_count(),
            event_id = %context.event_id,
            correlation_id = %context.correlation_id,
        );

        async {
            if self.over_budget(message.as_ref()) {
                warn!(
                    retry_count = self.config.retry_count,
                    "Delivery count exceeds retry budget, rejecting without dispatch"
                );
                message.reject().await?;
                return Ok(MessageOutcome::RejectedOverBudget);
            }

            match self.provider.dispatch(Arc::clone(&message)).await {
                Ok(()) => Ok(MessageOutcome::Dispatched),
                Err(e) => {
                    error!(error = %e, "Failed to dispatch message");
                    Ok(MessageOutcome::DispatchFailed)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn log_listener_stats(&self) {
        match self.receiver.queue_depth().await {
            Ok(Some(depth)) => info!(
                queue = %self.receiver.identifier(),
                active = depth.active,
                dead_lettered = depth.dead_lettered,
                "listenerStats"
            ),
            Ok(None) => {}
            Err(e) => warn!(queue = %self.receiver.identifier(), error = %e, "Failed to read queue depth"),
        }
    }

    /// Receive and dispatch until the queue closes or receiving fails
    pub async fn run_ingestion(&self) -> Result<()> {
        info!(queue = %self.receiver.identifier(), "Ingestion started");

        loop {
            let Some(message) = self.receiver.receive().await? else {
                warn!(queue = %self.receiver.identifier(), "Queue closed, stopping ingestion");
                return Err(DispatchError::QueueClosed);
            };

            self.handle_message(message).await?;
            self.log_listener_stats().await;

            let active = self.provider.active_messages();
            if let Err(e) = self.receiver.extend_locks(&active).await {
                warn!(error = %e, active = active.len(), "Failed to extend message locks");
            }
        }
    }

    /// One bounded reconcile pass
    pub async fn reconcile_once(&self) -> Result<()> {
        match tokio::time::timeout(self.config.reconcile_timeout, self.provider.reconcile()).await {
            Ok(result) => result?,
            Err(_) => return Err(DispatchError::Timeout(self.config.reconcile_timeout)),
        }
        info!(
            provider = self.provider.name(),
            in_progress = self.provider.in_progress_count(),
            "providerStats"
        );
        Ok(())
    }

    /// Reconcile on a fixed interval until a pass fails
    pub async fn run_reconciliation(&self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            debug!("Running reconcile");
            if let Err(e) = self.reconcile_once().await {
                error!(error = %e, "Reconcile failed");
                return Err(e);
            }
        }
    }

    /// Run ingestion and reconciliation concurrently. Returns the first error.
    pub async fn run(&self) -> Result<()> {
        info!(
            provider = self.provider.name(),
            queue = %self.receiver.identifier(),
            retry_count = self.config.retry_count,
            reconcile_interval_secs = self.config.reconcile_interval.as_secs(),
            "Dispatcher running"
        );

        tokio::select! {
            result = self.run_ingestion() => result,
            result = self.run_reconciliation() => result,
        }
    }

    /// Stop receiving. In-flight backend units keep running.
    pub async fn stop(&self) {
        self.receiver.stop().await;
        info!(
            in_progress = self.provider.in_progress_count(),
            "Dispatcher stopped"
        );
    }
}
