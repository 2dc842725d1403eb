//! Kubernetes provider
//!
//! One `batch/v1` Job per delivery attempt. The Job carries the dispatcher
//! name, message ID and delivery count as labels. Labels cannot hold every
//! message ID, so the raw ID also goes into an annotation; reconcile matches
//! Jobs back to in-flight messages through that annotation and the Job name.

pub mod client;
pub mod model;

use async_trait::async_trait;
use chrono::Utc;
use ion_config::AppConfig;
use ion_queue::QueueMessage;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::in_flight::{InFlightTable, PendingDeletes};
use crate::logs::LogCapture;
use crate::naming::NameRules;
use crate::pod::{ContainerSpec, ModulePod, PodBuilder};
use crate::provider::{decode_or_dead_letter, reject_after_failure, Provider};
use crate::Result;

pub use client::{JobsApi, KubeClient, KubeClientConfig};
use model::{
    Container, EmptyDirVolumeSource, EnvVar, Job, JobSpec, LocalObjectReference, ObjectMeta,
    PodSpec, PodTemplateSpec, Volume, VolumeMount, CONDITION_COMPLETE, CONDITION_FAILED,
};

pub const DISPATCHER_NAME_LABEL: &str = "dispatchername";
pub const MESSAGE_ID_LABEL: &str = "messageid";
pub const DELIVERY_COUNT_LABEL: &str = "deliverycount";
pub const MESSAGE_ID_ANNOTATION: &str = "ion/messageid";

const MAX_NAME_LEN: usize = 63;

const JOB_NAME_RULES: NameRules = NameRules {
    max_len: MAX_NAME_LEN,
    allowed: |c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-',
    normalise: |c| {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        }
    },
};

/// Terminal state of a Job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed,
}

/// Terminal outcome of a Job, `None` while it is still running
pub fn job_outcome(job: &Job) -> Option<JobOutcome> {
    if job.true_condition(CONDITION_FAILED).is_some() {
        Some(JobOutcome::Failed)
    } else if job.true_condition(CONDITION_COMPLETE).is_some() {
        Some(JobOutcome::Succeeded)
    } else {
        None
    }
}

/// Job name for one delivery attempt: `<message_id>-v<delivery_count>`.
///
/// IDs that are not already lowercase DNS labels are lowercased, stripped to
/// `[a-z0-9-]` and suffixed with a digest of the raw ID.
pub fn job_name(message_id: &str, delivery_count: u32) -> String {
    JOB_NAME_RULES.attempt_name(message_id, delivery_count)
}

/// Label value for an arbitrary string: `[A-Za-z0-9_.-]`, at most 63
/// characters, starting and ending with an alphanumeric.
pub fn label_value(value: &str) -> String {
    let mut sanitized: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    sanitized.truncate(MAX_NAME_LEN);
    sanitized
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Provider running module pods as Kubernetes Jobs
pub struct KubernetesProvider {
    api: Arc<dyn JobsApi>,
    dispatcher_name: String,
    pods: PodBuilder,
    max_running_time_mins: u32,
    pull_policy: &'static str,
    image_pull_secret: Option<String>,
    orphan_cleanup_after: Option<Duration>,
    logs: LogCapture,
    in_flight: InFlightTable,
    pending_deletes: PendingDeletes,
}

impl KubernetesProvider {
    pub fn new(config: &AppConfig, api: Arc<dyn JobsApi>) -> Self {
        let image_pull_secret = if config.kubernetes.image_pull_secret_name.is_empty() {
            None
        } else {
            Some(config.kubernetes.image_pull_secret_name.clone())
        };

        Self {
            api,
            dispatcher_name: label_value(&config.hostname),
            pods: PodBuilder::from_config(config),
            max_running_time_mins: config.job.max_running_time_mins,
            pull_policy: if config.job.pull_always {
                "Always"
            } else {
                "IfNotPresent"
            },
            image_pull_secret,
            orphan_cleanup_after: config
                .kubernetes
                .orphan_cleanup_after_secs
                .map(Duration::from_secs),
            logs: LogCapture::from_config(config),
            in_flight: InFlightTable::new(),
            pending_deletes: PendingDeletes::new(),
        }
    }

    /// Provider talking to the API server configured in `[kubernetes]`, or to
    /// the cluster the dispatcher runs in.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.dispatcher.backend_timeout_secs);
        let k8s = &config.kubernetes;

        let client_config = if k8s.api_server.is_empty() {
            KubeClientConfig::in_cluster(&k8s.namespace, timeout)?
        } else {
            let ca_cert = if k8s.ca_cert_path.is_empty() {
                None
            } else {
                Some(std::fs::read(&k8s.ca_cert_path).map_err(|e| {
                    crate::DispatchError::Config(format!(
                        "failed to read {}: {}",
                        k8s.ca_cert_path, e
                    ))
                })?)
            };
            KubeClientConfig {
                api_server: k8s.api_server.clone(),
                namespace: k8s.namespace.clone(),
                token: (!k8s.token.is_empty()).then(|| k8s.token.clone()),
                ca_cert,
                timeout,
            }
        };

        let client = KubeClient::new(client_config)?;
        Ok(Self::new(config, Arc::new(client)))
    }

    fn build_job(&self, name: &str, message: &dyn QueueMessage, pod: &ModulePod) -> Job {
        let mut labels = BTreeMap::new();
        labels.insert(DISPATCHER_NAME_LABEL.to_string(), self.dispatcher_name.clone());
        labels.insert(MESSAGE_ID_LABEL.to_string(), label_value(message.id()));
        labels.insert(
            DELIVERY_COUNT_LABEL.to_string(),
            message.delivery_count().to_string(),
        );
        let mut annotations = BTreeMap::new();
        annotations.insert(MESSAGE_ID_ANNOTATION.to_string(), message.id().to_string());

        let mount = VolumeMount {
            name: pod.volume_name.clone(),
            mount_path: pod.mount_path.clone(),
        };
        let to_container = |spec: &ContainerSpec| Container {
            name: spec.name.clone(),
            image: spec.image.clone(),
            args: spec.args.clone(),
            env: spec
                .env
                .iter()
                .map(|e| EnvVar {
                    name: e.name.clone(),
                    value: e.value.clone(),
                })
                .collect(),
            volume_mounts: vec![mount.clone()],
            image_pull_policy: Some(self.pull_policy.to_string()),
        };

        let pod_spec = PodSpec {
            init_containers: pod.init_containers.iter().map(to_container).collect(),
            containers: pod.containers.iter().map(to_container).collect(),
            restart_policy: Some("Never".to_string()),
            volumes: vec![Volume {
                name: pod.volume_name.clone(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
            }],
            image_pull_secrets: self
                .image_pull_secret
                .iter()
                .map(|name| LocalObjectReference { name: name.clone() })
                .collect(),
        };

        Job::new(
            ObjectMeta {
                name: name.to_string(),
                namespace: None,
                labels: labels.clone(),
                annotations,
                creation_timestamp: None,
            },
            JobSpec {
                completions: Some(1),
                backoff_limit: Some(1),
                active_deadline_seconds: Some(i64::from(self.max_running_time_mins) * 60),
                template: PodTemplateSpec {
                    metadata: ObjectMeta {
                        labels,
                        ..Default::default()
                    },
                    spec: pod_spec,
                },
            },
        )
    }

    async fn capture_logs(&self, name: &str, message_id: &str, succeeded: bool) {
        if !self.logs.enabled {
            return;
        }
        match self.api.job_logs(name).await {
            Ok(logs) => self.logs.emit(name, message_id, succeeded, &logs),
            Err(e) => warn!(job = %name, error = %e, "Failed to fetch job logs"),
        }
    }

    async fn delete_or_defer(&self, name: &str) {
        if let Err(e) = self.api.delete_job(name).await {
            warn!(job = %name, error = %e, "Failed to delete job, will retry on next reconcile");
            self.pending_deletes.insert(name);
        }
    }

    async fn retry_pending_deletes(&self) {
        for name in self.pending_deletes.snapshot() {
            match self.api.delete_job(&name).await {
                Ok(()) => {
                    info!(job = %name, "Deleted job on retry");
                    self.pending_deletes.remove(&name);
                }
                Err(e) => warn!(job = %name, error = %e, "Retrying job delete failed"),
            }
        }
    }

    /// A Job of this dispatcher with no in-flight message (restart leftover or
    /// a superseded attempt). Left alone unless it finished long enough ago.
    async fn handle_orphan(&self, job: &Job) {
        if self.pending_deletes.contains(job.name()) {
            return;
        }

        let Some(threshold) = self.orphan_cleanup_after else {
            debug!(job = %job.name(), "Leaving orphaned job untouched");
            return;
        };

        let finished_at = [CONDITION_FAILED, CONDITION_COMPLETE]
            .iter()
            .find_map(|t| job.true_condition(t))
            .map(|c| c.last_transition_time.or(job.metadata.creation_timestamp));
        let Some(finished_at) = finished_at else {
            debug!(job = %job.name(), "Orphaned job still running, leaving it");
            return;
        };

        let old_enough = finished_at
            .map(|at| (Utc::now() - at).to_std().unwrap_or_default() >= threshold)
            .unwrap_or(false);
        if old_enough {
            info!(job = %job.name(), "Removing finished orphaned job");
            self.delete_or_defer(job.name()).await;
        }
    }
}

#[async_trait]
impl Provider for KubernetesProvider {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn dispatch(&self, message: Arc<dyn QueueMessage>) -> Result<()> {
        let event = decode_or_dead_letter(message.as_ref()).await?;

        let name = job_name(message.id(), message.delivery_count());
        let pod = self.pods.build(&event);
        let job = self.build_job(&name, message.as_ref(), &pod);

        if let Err(e) = self.api.create_job(&job).await {
            return Err(reject_after_failure(message.as_ref(), e).await);
        }

        self.in_flight
            .insert(message.id().to_string(), name.clone(), message);
        info!(job = %name, in_progress = self.in_flight.len(), "Job created");
        Ok(())
    }

    fn in_progress_count(&self) -> usize {
        self.in_flight.len()
    }

    async fn reconcile(&self) -> Result<()> {
        self.retry_pending_deletes().await;

        let jobs = self.api.list_jobs().await?;
        for job in &jobs {
            let tracked = job
                .annotation(MESSAGE_ID_ANNOTATION)
                .filter(|id| self.in_flight.get_attempt(id, job.name()).is_some());
            let Some(message_id) = tracked else {
                if job.label(DISPATCHER_NAME_LABEL) == Some(self.dispatcher_name.as_str()) {
                    self.handle_orphan(job).await;
                }
                continue;
            };

            let Some(outcome) = job_outcome(job) else {
                continue;
            };

            let Some(entry) = self.in_flight.remove_attempt(message_id, job.name()) else {
                continue;
            };
            self.capture_logs(job.name(), message_id, outcome == JobOutcome::Succeeded)
                .await;
            self.delete_or_defer(job.name()).await;

            let message = entry.message;
            match outcome {
                JobOutcome::Succeeded => {
                    info!(job = %job.name(), message_id = %message.id(), "Job complete, accepting message");
                    message.accept().await?;
                }
                JobOutcome::Failed => {
                    warn!(job = %job.name(), message_id = %message.id(), "Job failed, rejecting message");
                    message.reject().await?;
                }
            }
        }

        debug!(
            jobs = jobs.len(),
            in_progress = self.in_flight.len(),
            pending_deletes = self.pending_deletes.len(),
            "Kubernetes reconcile complete"
        );
        Ok(())
    }

    fn active_messages(&self) -> Vec<Arc<dyn QueueMessage>> {
        self.in_flight.messages()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_name() {
        assert_eq!(job_name("m1", 0), "m1-v0");
        assert_eq!(job_name("abc-123", 4), "abc-123-v4");
        assert_eq!(
            job_name("M1", 0),
            format!("m1-{}-v0", crate::naming::id_digest("M1"))
        );
        assert_eq!(
            job_name("a.b_c", 1),
            format!("a-b-c-{}-v1", crate::naming::id_digest("a.b_c"))
        );
        assert_eq!(
            job_name("_x", 2),
            format!("x-{}-v2", crate::naming::id_digest("_x"))
        );
    }

    #[test]
    fn test_job_names_never_collide() {
        let ids = ["x", "x-", "X", "x.", "x_", "-x"];
        let mut names: Vec<String> = ids.iter().map(|id| job_name(id, 0)).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), ids.len());

        let a = job_name(&format!("{}-a", "p".repeat(70)), 0);
        let b = job_name(&format!("{}-b", "p".repeat(70)), 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_job_name_is_bounded() {
        let long = "a".repeat(200);
        let name = job_name(&long, 12);
        assert_eq!(name.len(), MAX_NAME_LEN);
        assert!(name.ends_with("-v12"));
    }

    #[test]
    fn test_job_names_differ_per_attempt() {
        assert_ne!(job_name("m", 0), job_name("m", 1));
    }

    #[test]
    fn test_label_value() {
        assert_eq!(label_value("M1"), "M1");
        assert_eq!(label_value("host/name:1"), "host-name-1");
        assert_eq!(label_value("-x-"), "x");
        assert_eq!(label_value(&"b".repeat(80)).len(), MAX_NAME_LEN);
    }

    #[test]
    fn test_job_outcome() {
        let mut job = Job::new(ObjectMeta::default(), JobSpec {
            completions: None,
            backoff_limit: None,
            active_deadline_seconds: None,
            template: PodTemplateSpec {
                metadata: ObjectMeta::default(),
                spec: PodSpec::default(),
            },
        });
        assert_eq!(job_outcome(&job), None);

        let mut pending = model::JobCondition::new(CONDITION_COMPLETE);
        pending.status = "False".to_string();
        job.status = Some(model::JobStatus {
            conditions: vec![pending],
            ..Default::default()
        });
        assert_eq!(job_outcome(&job), None);

        job.status = Some(model::JobStatus {
            conditions: vec![model::JobCondition::new(CONDITION_FAILED)],
            ..Default::default()
        });
        assert_eq!(job_outcome(&job), Some(JobOutcome::Failed));
    }
}
