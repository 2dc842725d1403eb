//! Azure Batch REST client with Azure AD client-credentials auth

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::debug;

use super::model::{
    CloudJob, CloudPool, CloudTask, JobAddParameter, PoolAddParameter, TaskAddParameter,
    TaskListResult,
};
use crate::http::check_status;
use crate::Result;

const BATCH_SCOPE: &str = "https://batch.core.windows.net/.default";
const ODATA_CONTENT_TYPE: &str = "application/json; odata=minimalmetadata";

/// Refresh tokens this long before they expire
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(120);

/// Batch account operations the provider needs
#[async_trait]
pub trait BatchApi: Send + Sync {
    /// `None` when the pool does not exist
    async fn get_pool(&self, pool_id: &str) -> Result<Option<CloudPool>>;

    async fn add_pool(&self, pool: &PoolAddParameter) -> Result<()>;

    /// `None` when the job does not exist
    async fn get_job(&self, job_id: &str) -> Result<Option<CloudJob>>;

    async fn add_job(&self, job: &JobAddParameter) -> Result<()>;

    async fn add_task(&self, job_id: &str, task: &TaskAddParameter) -> Result<()>;

    async fn list_tasks(&self, job_id: &str) -> Result<Vec<CloudTask>>;

    /// Delete a task. A task that is already gone counts as deleted.
    async fn delete_task(&self, job_id: &str, task_id: &str) -> Result<()>;

    /// Content of a file under the task directory, `None` when it does not exist
    async fn get_task_file(&self, job_id: &str, task_id: &str, file_path: &str)
        -> Result<Option<String>>;
}

#[derive(Debug, Clone)]
pub struct BatchClientConfig {
    pub base_url: String,
    pub api_version: String,
    pub authority_host: String,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Batch REST client
pub struct BatchClient {
    client: Client,
    config: BatchClientConfig,
    token: Mutex<Option<CachedToken>>,
}

impl BatchClient {
    pub fn new(config: BatchClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            config,
            token: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn access_token(&self) -> Result<String> {
        let cached = self
            .token
            .lock()
            .as_ref()
            .filter(|token| Instant::now() < token.refresh_at)
            .map(|token| token.value.clone());
        if let Some(value) = cached {
            return Ok(value);
        }

        let token_url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.config.authority_host.trim_end_matches('/'),
            self.config.tenant_id
        );
        let response = self
            .client
            .post(token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("scope", BATCH_SCOPE),
            ])
            .send()
            .await?;
        let token: TokenResponse = check_status(response).await?.json().await?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *self.token.lock() = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        debug!(expires_in = token.expires_in, "Acquired Azure AD token for Batch");

        Ok(token.access_token)
    }

    async fn request(&self, builder: RequestBuilder) -> Result<RequestBuilder> {
        let token = self.access_token().await?;
        Ok(builder
            .bearer_auth(token)
            .query(&[("api-version", self.config.api_version.as_str())]))
    }

    async fn get_optional<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<Option<T>> {
        let response = self.request(self.client.get(self.url(path))).await?.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check_status(response).await?.json().await?))
    }

    async fn post_json<B: serde::Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
        let payload = serde_json::to_vec(body)?;
        let response = self
            .request(self.client.post(self.url(path)))
            .await?
            .header(reqwest::header::CONTENT_TYPE, ODATA_CONTENT_TYPE)
            .body(payload)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

#[async_trait]
impl BatchApi for BatchClient {
    async fn get_pool(&self, pool_id: &str) -> Result<Option<CloudPool>> {
        self.get_optional(&format!("pools/{}", pool_id)).await
    }

    async fn add_pool(&self, pool: &PoolAddParameter) -> Result<()> {
        self.post_json("pools", pool).await
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<CloudJob>> {
        self.get_optional(&format!("jobs/{}", job_id)).await
    }

    async fn add_job(&self, job: &JobAddParameter) -> Result<()> {
        self.post_json("jobs", job).await
    }

    async fn add_task(&self, job_id: &str, task: &TaskAddParameter) -> Result<()> {
        self.post_json(&format!("jobs/{}/tasks", job_id), task).await
    }

    async fn list_tasks(&self, job_id: &str) -> Result<Vec<CloudTask>> {
        let mut tasks = Vec::new();

        let first = self
            .request(self.client.get(self.url(&format!("jobs/{}/tasks", job_id))))
            .await?;
        let mut page: TaskListResult = check_status(first.send().await?).await?.json().await?;

        loop {
            tasks.extend(page.value);
            let Some(next_link) = page.next_link.filter(|link| !link.is_empty()) else {
                break;
            };
            // nextLink already carries the api-version
            let token = self.access_token().await?;
            let response = self.client.get(next_link).bearer_auth(token).send().await?;
            page = check_status(response).await?.json().await?;
        }

        Ok(tasks)
    }

    async fn delete_task(&self, job_id: &str, task_id: &str) -> Result<()> {
        let response = self
            .request(
                self.client
                    .delete(self.url(&format!("jobs/{}/tasks/{}", job_id, task_id))),
            )
            .await?
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(task = %task_id, "Task already deleted");
            return Ok(());
        }
        check_status(response).await?;
        Ok(())
    }

    async fn get_task_file(
        &self,
        job_id: &str,
        task_id: &str,
        file_path: &str,
    ) -> Result<Option<String>> {
        let path = format!(
            "jobs/{}/tasks/{}/files/{}",
            job_id,
            task_id,
            file_path.replace('/', "%2F")
        );
        let response = self.request(self.client.get(self.url(&path))).await?.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check_status(response).await?.text().await?))
    }
}

impl From<&ion_config::AzureBatchConfig> for BatchClientConfig {
    fn from(config: &ion_config::AzureBatchConfig) -> Self {
        Self {
            base_url: config.base_url(),
            api_version: config.api_version.clone(),
            authority_host: config.authority_host.clone(),
            tenant_id: config.tenant_id.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            timeout: Duration::from_secs(60),
        }
    }
}

impl BatchClientConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
