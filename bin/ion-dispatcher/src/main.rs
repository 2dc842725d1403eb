//! Ion Dispatcher
//!
//! Consumes the module's event queue and runs one containerised module
//! execution per message on Kubernetes or Azure Batch. Each message is
//! accepted when its execution succeeds and rejected otherwise, so the
//! broker governs retries and dead-lettering.
//!
//! Configuration comes from a TOML file (`ION_CONFIG` or one of the standard
//! paths) with `ION_*` environment overrides. A `.env` file is loaded first
//! for local development.

use std::sync::Arc;

use anyhow::{Context, Result};
use ion_config::{AppConfig, ConfigLoader};
use ion_dispatcher::{select_provider, Dispatcher, DispatcherConfig};
use ion_queue::amqp::{AmqpReceiver, AmqpReceiverConfig};
use ion_queue::{InMemoryQueue, QueueReceiver};
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    let config = ConfigLoader::new()
        .load()
        .context("failed to load configuration")?;

    ion_common::logging::init_logging(&config.log_level);

    info!(
        hostname = %config.hostname,
        module = %config.module_name,
        subscribes_to = %config.subscribes_to_event,
        "Starting Ion Dispatcher"
    );

    config.validate().context("invalid configuration")?;

    if config.print_config {
        print_config(&config);
    }

    let receiver = build_receiver(&config).await?;
    let provider = select_provider(&config).context("failed to initialise provider")?;
    let dispatcher = Dispatcher::new(receiver, provider, DispatcherConfig::from(&config));

    let result = tokio::select! {
        result = dispatcher.run() => result.map_err(anyhow::Error::from),
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            Ok(())
        }
    };

    dispatcher.stop().await;

    if let Err(e) = &result {
        error!(error = %e, "Dispatcher stopped on a fatal error");
    }
    result
}

fn print_config(config: &AppConfig) {
    let shown = if config.log_sensitive_config {
        config.clone()
    } else {
        config.redacted()
    };
    match toml::to_string_pretty(&shown) {
        Ok(rendered) => info!("Effective configuration:\n{}", rendered),
        Err(e) => warn!(error = %e, "Failed to render configuration"),
    }
}

async fn build_receiver(config: &AppConfig) -> Result<Arc<dyn QueueReceiver>> {
    let queue_name = config.queue_name();

    match config.queue.queue_type.as_str() {
        "amqp" => {
            let amqp = &config.queue.amqp;
            let receiver = AmqpReceiver::connect(AmqpReceiverConfig {
                uri: amqp.uri.clone(),
                queue_name: queue_name.clone(),
                consumer_tag: format!("{}-{}", config.hostname, config.module_name),
                prefetch_count: amqp.prefetch_count,
                declare_queue: amqp.declare_queue,
                dead_letter_exchange: non_empty(&amqp.dead_letter_exchange),
                dead_letter_queue: non_empty(&amqp.dead_letter_queue),
                delivery_limit: Some(config.job.retry_count + 1),
            })
            .await
            .with_context(|| format!("failed to connect to queue {}", queue_name))?;
            info!(queue = %queue_name, "AMQP receiver connected");
            Ok(Arc::new(receiver))
        }
        "memory" => {
            warn!(queue = %queue_name, "Using in-memory queue, nothing will be received from a broker");
            Ok(Arc::new(InMemoryQueue::new(queue_name)))
        }
        other => anyhow::bail!("unsupported queue type: {}", other),
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
