//! Minimal Kubernetes Jobs REST client

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, info};

use super::model::{DeleteOptions, Job, JobList, PodList};
use crate::http::check_status;
use crate::logs::ContainerLog;
use crate::{DispatchError, Result};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Jobs API operations the provider needs, scoped to one namespace
#[async_trait]
pub trait JobsApi: Send + Sync {
    async fn create_job(&self, job: &Job) -> Result<Job>;

    async fn list_jobs(&self) -> Result<Vec<Job>>;

    /// Delete a job and its pods. A job that is already gone counts as deleted.
    async fn delete_job(&self, name: &str) -> Result<()>;

    /// Logs of every container of the job's pods, in start order
    async fn job_logs(&self, name: &str) -> Result<Vec<ContainerLog>>;
}

/// Connection settings for [`KubeClient`]
#[derive(Debug, Clone)]
pub struct KubeClientConfig {
    pub api_server: String,
    pub namespace: String,
    pub token: Option<String>,
    /// PEM encoded CA bundle for the API server
    pub ca_cert: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl KubeClientConfig {
    /// Service account credentials mounted into the dispatcher's own pod
    pub fn in_cluster(namespace: &str, timeout: Duration) -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
            DispatchError::Config(
                "KUBERNETES_SERVICE_HOST is not set and no api_server is configured".to_string(),
            )
        })?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());

        let token = std::fs::read_to_string(format!("{}/token", SERVICE_ACCOUNT_DIR))
            .map_err(|e| DispatchError::Config(format!("failed to read service account token: {}", e)))?;
        let ca_cert = std::fs::read(format!("{}/ca.crt", SERVICE_ACCOUNT_DIR))
            .map_err(|e| DispatchError::Config(format!("failed to read service account CA: {}", e)))?;

        Ok(Self {
            api_server: format!("https://{}:{}", host, port),
            namespace: namespace.to_string(),
            token: Some(token.trim().to_string()),
            ca_cert: Some(ca_cert),
            timeout,
        })
    }
}

/// Jobs API over HTTPS
pub struct KubeClient {
    client: Client,
    base_url: String,
    namespace: String,
    token: Option<String>,
}

impl KubeClient {
    pub fn new(config: KubeClientConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(10));

        if let Some(pem) = &config.ca_cert {
            let cert = reqwest::Certificate::from_pem(pem)?;
            builder = builder.add_root_certificate(cert);
        }

        info!(api_server = %config.api_server, namespace = %config.namespace, "Kubernetes client configured");

        Ok(Self {
            client: builder.build()?,
            base_url: config.api_server.trim_end_matches('/').to_string(),
            namespace: config.namespace,
            token: config.token,
        })
    }

    fn jobs_url(&self) -> String {
        format!(
            "{}/apis/batch/v1/namespaces/{}/jobs",
            self.base_url, self.namespace
        )
    }

    fn pods_url(&self) -> String {
        format!("{}/api/v1/namespaces/{}/pods", self.base_url, self.namespace)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl JobsApi for KubeClient {
    async fn create_job(&self, job: &Job) -> Result<Job> {
        let response = self
            .authorize(self.client.post(self.jobs_url()))
            .json(job)
            .send()
            .await?;
        let created = check_status(response).await?.json::<Job>().await?;
        debug!(job = %created.name(), "Job created");
        Ok(created)
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        let mut continue_token: Option<String> = None;

        loop {
            let mut request = self.authorize(self.client.get(self.jobs_url()));
            if let Some(token) = &continue_token {
                request = request.query(&[("continue", token)]);
            }

            let page = check_status(request.send().await?)
                .await?
                .json::<JobList>()
                .await?;
            jobs.extend(page.items);

            match page.metadata.continue_token {
                Some(token) if !token.is_empty() => continue_token = Some(token),
                _ => break,
            }
        }

        Ok(jobs)
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        let response = self
            .authorize(self.client.delete(format!("{}/{}", self.jobs_url(), name)))
            .json(&DeleteOptions::background())
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(job = %name, "Job already deleted");
            return Ok(());
        }
        check_status(response).await?;
        debug!(job = %name, "Job deleted");
        Ok(())
    }

    async fn job_logs(&self, name: &str) -> Result<Vec<ContainerLog>> {
        let selector = format!("job-name={}", name);
        let response = self
            .authorize(self.client.get(self.pods_url()))
            .query(&[("labelSelector", selector.as_str())])
            .send()
            .await?;
        let pods = check_status(response).await?.json::<PodList>().await?;

        let mut logs = Vec::new();
        for pod in &pods.items {
            for container in pod.container_names() {
                let response = self
                    .authorize(self.client.get(format!(
                        "{}/{}/log",
                        self.pods_url(),
                        pod.metadata.name
                    )))
                    .query(&[("container", container)])
                    .send()
                    .await?;
                // a container that never started has no log
                if matches!(
                    response.status(),
                    StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST
                ) {
                    continue;
                }
                let content = check_status(response).await?.text().await?;
                logs.push(ContainerLog::new(container, content));
            }
        }
        Ok(logs)
    }
}
