//! Azure Batch provider
//!
//! All tasks of a dispatcher live in one wrapper job bound to one pool. Both
//! are created (or waited for) on the first dispatch. Each delivery attempt
//! becomes a task whose command line is the rendered pod script.

pub mod client;
pub mod model;
pub mod script;

use async_trait::async_trait;
use ion_config::AppConfig;
use ion_queue::QueueMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::in_flight::{InFlightTable, PendingDeletes};
use crate::logs::{ContainerLog, LogCapture};
use crate::naming::NameRules;
use crate::pod::{PodBuilder, COMMIT_CONTAINER, PREPARE_CONTAINER, WORKER_CONTAINER};
use crate::provider::{decode_or_dead_letter, reject_after_failure, Provider};
use crate::{DispatchError, Result};

pub use client::{BatchApi, BatchClient, BatchClientConfig};
use model::{
    ImageReference, JobAddParameter, PoolAddParameter, PoolInformation, StartTask,
    TaskAddParameter, TaskConstraints, UserIdentity, VirtualMachineConfiguration,
    JOB_STATE_ACTIVE, JOB_STATE_DELETING, POOL_STATE_ACTIVE, TASK_STATE_COMPLETED,
};
use script::{command_line, render_pod_script, PodScript, RegistryCredentials};

const MAX_TASK_ID_LEN: usize = 64;

const IMAGE_PUBLISHER: &str = "canonical";
const IMAGE_OFFER: &str = "0001-com-ubuntu-server-jammy";
const IMAGE_SKU: &str = "22_04-lts";

/// Batch compares task IDs case-insensitively, so only lowercase IDs are
/// used verbatim.
const TASK_ID_RULES: NameRules = NameRules {
    max_len: MAX_TASK_ID_LEN,
    allowed: |c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_',
    normalise: |c| {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            c
        } else {
            '-'
        }
    },
};

/// Task files read back when a task finishes: the node agent's output, then
/// the per-container logs the pod script writes to its working directory.
const TASK_LOG_FILES: [(&str, &str); 5] = [
    ("stdout", "stdout.txt"),
    ("stderr", "stderr.txt"),
    (PREPARE_CONTAINER, "wd/prepare.log"),
    (WORKER_CONTAINER, "wd/worker.log"),
    (COMMIT_CONTAINER, "wd/commit.log"),
];

/// Task ID for one delivery attempt: `<message_id>-v<delivery_count>`.
///
/// IDs outside `[a-z0-9_-]` or too long are stripped to `[A-Za-z0-9_-]` and
/// suffixed with a digest of the raw ID.
pub fn task_id(message_id: &str, delivery_count: u32) -> String {
    TASK_ID_RULES.attempt_name(message_id, delivery_count)
}

/// Display name tying a task back to its message: `<job_id>:<message_id>`
pub fn task_display_name(job_id: &str, message_id: &str) -> String {
    format!("{}:{}", job_id, message_id)
}

fn message_id_from_display_name<'a>(job_id: &str, display_name: &'a str) -> Option<&'a str> {
    display_name
        .strip_prefix(job_id)
        .and_then(|rest| rest.strip_prefix(':'))
}

#[derive(Debug, Clone)]
struct PoolSettings {
    pool_id: String,
    vm_size: String,
    target_dedicated_nodes: u32,
    node_agent_sku_id: String,
    start_task_command: String,
}

/// Provider running module pods as Azure Batch tasks
pub struct AzureBatchProvider {
    api: Arc<dyn BatchApi>,
    pool: PoolSettings,
    job_id: String,
    pods: PodBuilder,
    registries: Vec<RegistryCredentials>,
    pull_always: bool,
    requires_gpu: bool,
    max_running_time_mins: u32,
    poll_interval: Duration,
    poll_max_attempts: u32,
    logs: LogCapture,
    ready: OnceCell<()>,
    in_flight: InFlightTable,
    pending_deletes: PendingDeletes,
}

impl AzureBatchProvider {
    pub fn new(config: &AppConfig, api: Arc<dyn BatchApi>) -> Result<Self> {
        let batch = config
            .azure_batch
            .as_ref()
            .ok_or_else(|| DispatchError::Config("azure_batch section is missing".to_string()))?;

        let registries = if batch.image_repository_server.is_empty() {
            Vec::new()
        } else {
            vec![RegistryCredentials {
                server: batch.image_repository_server.clone(),
                username: batch.image_repository_username.clone(),
                password: batch.image_repository_password.clone(),
            }]
        };

        Ok(Self {
            api,
            pool: PoolSettings {
                pool_id: batch.pool_id.clone(),
                vm_size: batch.vm_size.clone(),
                target_dedicated_nodes: batch.target_dedicated_nodes,
                node_agent_sku_id: batch.node_agent_sku_id.clone(),
                start_task_command: batch.start_task_command.clone(),
            },
            job_id: config.batch_job_id(),
            pods: PodBuilder::from_config(config),
            registries,
            pull_always: config.job.pull_always,
            requires_gpu: batch.requires_gpu,
            max_running_time_mins: config.job.max_running_time_mins,
            poll_interval: Duration::from_secs(batch.pool_poll_interval_secs),
            poll_max_attempts: batch.pool_poll_max_attempts.max(1),
            logs: LogCapture::from_config(config),
            ready: OnceCell::new(),
            in_flight: InFlightTable::new(),
            pending_deletes: PendingDeletes::new(),
        })
    }

    /// Provider talking to the batch account configured in `[azure_batch]`
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let batch = config
            .azure_batch
            .as_ref()
            .ok_or_else(|| DispatchError::Config("azure_batch section is missing".to_string()))?;
        let client_config = BatchClientConfig::from(batch).with_timeout(Duration::from_secs(
            config.dispatcher.backend_timeout_secs,
        ));
        let client = BatchClient::new(client_config)?;
        Self::new(config, Arc::new(client))
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Whether the pool and wrapper job have been confirmed
    pub fn is_ready(&self) -> bool {
        self.ready.initialized()
    }

    async fn ensure_ready(&self) -> Result<()> {
        self.ready
            .get_or_try_init(|| async {
                self.ensure_pool().await?;
                self.ensure_job().await
            })
            .await?;
        Ok(())
    }

    /// Pool created when the configured one does not exist
    pub fn pool_parameters(&self) -> PoolAddParameter {
        let start_task = if self.pool.start_task_command.is_empty() {
            None
        } else {
            Some(StartTask {
                command_line: self.pool.start_task_command.clone(),
                user_identity: UserIdentity::pool_admin(),
                wait_for_success: true,
            })
        };

        PoolAddParameter {
            id: self.pool.pool_id.clone(),
            vm_size: self.pool.vm_size.clone(),
            virtual_machine_configuration: VirtualMachineConfiguration {
                image_reference: ImageReference {
                    publisher: IMAGE_PUBLISHER.to_string(),
                    offer: IMAGE_OFFER.to_string(),
                    sku: IMAGE_SKU.to_string(),
                    version: "latest".to_string(),
                },
                node_agent_sku_id: self.pool.node_agent_sku_id.clone(),
            },
            target_dedicated_nodes: self.pool.target_dedicated_nodes,
            task_slots_per_node: 1,
            start_task,
        }
    }

    async fn ensure_pool(&self) -> Result<()> {
        let pool_id = &self.pool.pool_id;

        if self.api.get_pool(pool_id).await?.is_none() {
            info!(pool = %pool_id, "Pool missing, creating");
            match self.api.add_pool(&self.pool_parameters()).await {
                Ok(()) => info!(pool = %pool_id, "Pool created"),
                Err(e) if e.is_conflict() => debug!(pool = %pool_id, "Pool created concurrently"),
                Err(e) => return Err(e),
            }
        }

        for attempt in 1..=self.poll_max_attempts {
            let state = self.api.get_pool(pool_id).await?.map(|pool| pool.state);
            if state.as_deref() == Some(POOL_STATE_ACTIVE) {
                info!(pool = %pool_id, "Pool active");
                return Ok(());
            }
            info!(pool = %pool_id, attempt, state = ?state, "Pool not active yet, waiting");
            tokio::time::sleep(self.poll_interval).await;
        }

        Err(DispatchError::Timeout(
            self.poll_interval.saturating_mul(self.poll_max_attempts),
        ))
    }

    async fn ensure_job(&self) -> Result<()> {
        for attempt in 1..=self.poll_max_attempts {
            match self.api.get_job(&self.job_id).await? {
                Some(job) if job.state == JOB_STATE_ACTIVE => {
                    info!(job = %self.job_id, "Wrapper job active");
                    return Ok(());
                }
                Some(job) if job.state == JOB_STATE_DELETING => {
                    info!(job = %self.job_id, attempt, "Wrapper job is being deleted, waiting");
                    tokio::time::sleep(self.poll_interval).await;
                }
                Some(job) => {
                    return Err(DispatchError::Backend(format!(
                        "wrapper job {} is in state {}",
                        self.job_id, job.state
                    )));
                }
                None => {
                    info!(job = %self.job_id, pool = %self.pool.pool_id, "Wrapper job missing, creating");
                    let job = JobAddParameter {
                        id: self.job_id.clone(),
                        pool_info: PoolInformation {
                            pool_id: self.pool.pool_id.clone(),
                        },
                    };
                    match self.api.add_job(&job).await {
                        Ok(()) => {}
                        Err(e) if e.is_conflict() => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        Err(DispatchError::Timeout(
            self.poll_interval.saturating_mul(self.poll_max_attempts),
        ))
    }

    fn build_task(&self, task_id: &str, message: &dyn QueueMessage, script: &str) -> TaskAddParameter {
        TaskAddParameter {
            id: task_id.to_string(),
            display_name: task_display_name(&self.job_id, message.id()),
            command_line: command_line(script),
            constraints: TaskConstraints {
                max_wall_clock_time: format!("PT{}M", self.max_running_time_mins),
            },
            user_identity: UserIdentity::pool_admin(),
        }
    }

    async fn submit(&self, message: &dyn QueueMessage, task_id: &str, pod_script: &PodScript<'_>) -> Result<()> {
        self.ensure_ready().await?;
        let script = render_pod_script(pod_script)?;
        let task = self.build_task(task_id, message, &script);
        self.api.add_task(&self.job_id, &task).await
    }

    async fn task_logs(&self, task_id: &str) -> Result<Vec<ContainerLog>> {
        let mut logs = Vec::new();
        for (name, path) in TASK_LOG_FILES {
            if let Some(content) = self.api.get_task_file(&self.job_id, task_id, path).await? {
                logs.push(ContainerLog::new(name, content));
            }
        }
        Ok(logs)
    }

    async fn capture_logs(&self, task_id: &str, message_id: &str, succeeded: bool) {
        if !self.logs.enabled {
            return;
        }
        match self.task_logs(task_id).await {
            Ok(logs) => self.logs.emit(task_id, message_id, succeeded, &logs),
            Err(e) => warn!(task = %task_id, error = %e, "Failed to fetch task logs"),
        }
    }

    async fn delete_or_defer(&self, task_id: &str) {
        if let Err(e) = self.api.delete_task(&self.job_id, task_id).await {
            warn!(task = %task_id, error = %e, "Failed to delete task, will retry on next reconcile");
            self.pending_deletes.insert(task_id);
        }
    }

    async fn retry_pending_deletes(&self) {
        for task_id in self.pending_deletes.snapshot() {
            match self.api.delete_task(&self.job_id, &task_id).await {
                Ok(()) => {
                    info!(task = %task_id, "Deleted task on retry");
                    self.pending_deletes.remove(&task_id);
                }
                Err(e) => warn!(task = %task_id, error = %e, "Retrying task delete failed"),
            }
        }
    }
}

#[async_trait]
impl Provider for AzureBatchProvider {
    fn name(&self) -> &'static str {
        "azurebatch"
    }

    async fn dispatch(&self, message: Arc<dyn QueueMessage>) -> Result<()> {
        let event = decode_or_dead_letter(message.as_ref()).await?;

        let task_id = task_id(message.id(), message.delivery_count());
        let pod = self.pods.build(&event);
        let gpu_containers: &[&str] = if self.requires_gpu {
            &[WORKER_CONTAINER]
        } else {
            &[]
        };
        let pod_script = PodScript {
            task_id: &task_id,
            pod: &pod,
            registries: &self.registries,
            pull_always: self.pull_always,
            gpu_containers,
        };

        if let Err(e) = self.submit(message.as_ref(), &task_id, &pod_script).await {
            return Err(reject_after_failure(message.as_ref(), e).await);
        }

        self.in_flight
            .insert(message.id().to_string(), task_id.clone(), message);
        info!(task = %task_id, job = %self.job_id, in_progress = self.in_flight.len(), "Task submitted");
        Ok(())
    }

    fn in_progress_count(&self) -> usize {
        self.in_flight.len()
    }

    async fn reconcile(&self) -> Result<()> {
        if !self.is_ready() {
            debug!("Batch pool and job not initialised yet, nothing to reconcile");
            return Ok(());
        }

        self.retry_pending_deletes().await;

        let tasks = self.api.list_tasks(&self.job_id).await?;
        for task in &tasks {
            let Some(message_id) = message_id_from_display_name(&self.job_id, &task.display_name)
            else {
                continue;
            };
            if self.in_flight.get_attempt(message_id, &task.id).is_none() {
                continue;
            }
            if task.state != TASK_STATE_COMPLETED {
                continue;
            }

            let Some(entry) = self.in_flight.remove_attempt(message_id, &task.id) else {
                continue;
            };
            let succeeded = task.exit_code() == Some(0);
            self.capture_logs(&task.id, message_id, succeeded).await;
            self.delete_or_defer(&task.id).await;

            let message = entry.message;
            match task.exit_code() {
                Some(0) => {
                    info!(task = %task.id, message_id = %message.id(), "Task succeeded, accepting message");
                    message.accept().await?;
                }
                exit_code => {
                    warn!(task = %task.id, message_id = %message.id(), exit_code = ?exit_code, "Task failed, rejecting message");
                    message.reject().await?;
                }
            }
        }

        debug!(
            tasks = tasks.len(),
            in_progress = self.in_flight.len(),
            pending_deletes = self.pending_deletes.len(),
            "Azure Batch reconcile complete"
        );
        Ok(())
    }

    fn active_messages(&self) -> Vec<Arc<dyn QueueMessage>> {
        self.in_flight.messages()
    }
}
