//! Configuration loader with file and environment variable support

use crate::{AppConfig, AzureBatchConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "ion-dispatcher.toml",
    "config.toml",
    "./config/dispatcher.toml",
    "/etc/ion/dispatcher.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        self.load_with(|key| env::var(key).ok())
    }

    /// Same as [`load`](Self::load) but reads overrides through `lookup`
    pub fn load_with<F>(&self, lookup: F) -> Result<AppConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file(&lookup) {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        apply_overrides(&mut config, &lookup);

        Ok(config)
    }

    fn find_config_file<F>(&self, lookup: &F) -> Option<PathBuf>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!(?path, "Configured config file does not exist");
        }

        if let Some(path) = lookup("ION_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn set_string<F>(lookup: &F, key: &str, target: &mut String)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup(key) {
        *target = val;
    }
}

fn set_parsed<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(val) = lookup(key) {
        match val.trim().parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(key, value = %val, "Ignoring unparsable environment override"),
        }
    }
}

fn apply_overrides<F>(config: &mut AppConfig, lookup: &F)
where
    F: Fn(&str) -> Option<String>,
{
    // General
    set_string(lookup, "ION_HOSTNAME", &mut config.hostname);
    set_string(lookup, "ION_MODULE_NAME", &mut config.module_name);
    set_string(lookup, "ION_SUBSCRIBES_TO_EVENT", &mut config.subscribes_to_event);
    set_string(lookup, "ION_EVENTS_PUBLISHED", &mut config.events_published);
    set_string(lookup, "ION_LOG_LEVEL", &mut config.log_level);
    set_string(lookup, "ION_MODULE_CONFIG_PATH", &mut config.module_config_path);
    set_parsed(lookup, "ION_PRINT_CONFIG", &mut config.print_config);
    set_parsed(lookup, "ION_LOG_SENSITIVE_CONFIG", &mut config.log_sensitive_config);

    // Queue
    set_string(lookup, "ION_QUEUE_TYPE", &mut config.queue.queue_type);
    set_string(lookup, "ION_AMQP_URI", &mut config.queue.amqp.uri);
    set_string(lookup, "ION_AMQP_QUEUE_NAME", &mut config.queue.amqp.queue_name);
    set_string(
        lookup,
        "ION_AMQP_DEAD_LETTER_EXCHANGE",
        &mut config.queue.amqp.dead_letter_exchange,
    );
    set_string(
        lookup,
        "ION_AMQP_DEAD_LETTER_QUEUE",
        &mut config.queue.amqp.dead_letter_queue,
    );
    set_parsed(lookup, "ION_AMQP_PREFETCH_COUNT", &mut config.queue.amqp.prefetch_count);

    // Job
    set_parsed(
        lookup,
        "ION_JOB_MAX_RUNNING_TIME_MINS",
        &mut config.job.max_running_time_mins,
    );
    set_parsed(lookup, "ION_JOB_RETRY_COUNT", &mut config.job.retry_count);
    set_string(lookup, "ION_JOB_WORKER_IMAGE", &mut config.job.worker_image);
    set_string(lookup, "ION_JOB_HANDLER_IMAGE", &mut config.job.handler_image);
    set_parsed(lookup, "ION_JOB_PULL_ALWAYS", &mut config.job.pull_always);

    // Handler
    set_parsed(lookup, "ION_HANDLER_SERVER_PORT", &mut config.handler.server_port);
    set_string(
        lookup,
        "ION_HANDLER_BLOB_ACCOUNT_NAME",
        &mut config.handler.blob_storage.account_name,
    );
    set_string(
        lookup,
        "ION_HANDLER_BLOB_ACCOUNT_KEY",
        &mut config.handler.blob_storage.account_key,
    );
    set_string(
        lookup,
        "ION_HANDLER_DOCUMENT_STORE_NAME",
        &mut config.handler.document_storage.name,
    );
    set_string(
        lookup,
        "ION_HANDLER_DOCUMENT_STORE_PASSWORD",
        &mut config.handler.document_storage.password,
    );
    set_string(
        lookup,
        "ION_HANDLER_EVENT_PROVIDER_KEY",
        &mut config.handler.event_provider.key,
    );

    // Kubernetes
    set_string(lookup, "ION_KUBERNETES_NAMESPACE", &mut config.kubernetes.namespace);
    set_string(
        lookup,
        "ION_KUBERNETES_IMAGE_PULL_SECRET_NAME",
        &mut config.kubernetes.image_pull_secret_name,
    );
    set_string(lookup, "ION_KUBERNETES_API_SERVER", &mut config.kubernetes.api_server);
    set_string(lookup, "ION_KUBERNETES_TOKEN", &mut config.kubernetes.token);

    // Azure Batch: any override for the section enables it
    if lookup("ION_AZURE_BATCH_POOL_ID").is_some() && config.azure_batch.is_none() {
        config.azure_batch = Some(AzureBatchConfig::default());
    }
    if let Some(batch) = config.azure_batch.as_mut() {
        set_string(lookup, "ION_AZURE_BATCH_POOL_ID", &mut batch.pool_id);
        set_string(lookup, "ION_AZURE_BATCH_JOB_ID", &mut batch.job_id);
        set_string(lookup, "ION_AZURE_BATCH_ACCOUNT_NAME", &mut batch.batch_account_name);
        set_string(
            lookup,
            "ION_AZURE_BATCH_ACCOUNT_LOCATION",
            &mut batch.batch_account_location,
        );
        set_string(lookup, "ION_AZURE_BATCH_URL", &mut batch.batch_url);
        set_parsed(lookup, "ION_AZURE_BATCH_REQUIRES_GPU", &mut batch.requires_gpu);
        set_string(
            lookup,
            "ION_AZURE_BATCH_START_TASK_COMMAND",
            &mut batch.start_task_command,
        );
        set_string(lookup, "ION_AZURE_TENANT_ID", &mut batch.tenant_id);
        set_string(lookup, "ION_AZURE_CLIENT_ID", &mut batch.client_id);
        set_string(lookup, "ION_AZURE_CLIENT_SECRET", &mut batch.client_secret);
        set_string(
            lookup,
            "ION_IMAGE_REPOSITORY_SERVER",
            &mut batch.image_repository_server,
        );
        set_string(
            lookup,
            "ION_IMAGE_REPOSITORY_USERNAME",
            &mut batch.image_repository_username,
        );
        set_string(
            lookup,
            "ION_IMAGE_REPOSITORY_PASSWORD",
            &mut batch.image_repository_password,
        );
    }

    // Dispatcher
    set_parsed(
        lookup,
        "ION_RECONCILE_INTERVAL_SECS",
        &mut config.dispatcher.reconcile_interval_secs,
    );
    set_parsed(
        lookup,
        "ION_BACKEND_TIMEOUT_SECS",
        &mut config.dispatcher.backend_timeout_secs,
    );
    set_parsed(
        lookup,
        "ION_RECONCILE_TIMEOUT_SECS",
        &mut config.dispatcher.reconcile_timeout_secs,
    );
    set_parsed(lookup, "ION_CAPTURE_LOGS", &mut config.dispatcher.capture_logs);
    set_parsed(lookup, "ION_MAX_LOG_BYTES", &mut config.dispatcher.max_log_bytes);
}
