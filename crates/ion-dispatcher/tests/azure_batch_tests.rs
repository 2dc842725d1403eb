//! AzureBatchProvider Tests
//!
//! Tests for:
//! - Lazy pool and wrapper job initialisation
//! - Task shape
//! - Exit code driven accept/reject
//! - Deferred deletes and foreign tasks
//! - Task IDs for message IDs Batch cannot use verbatim
//! - Log capture of finished tasks

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use ion_config::{AppConfig, AzureBatchConfig};
use ion_dispatcher::azure_batch::model::{
    CloudJob, CloudPool, CloudTask, JobAddParameter, PoolAddParameter, TaskAddParameter,
    TaskExecutionInformation,
};
use ion_dispatcher::azure_batch::{task_id, AzureBatchProvider, BatchApi};
use ion_dispatcher::{DispatchError, Provider};
use ion_queue::{InMemoryQueue, QueueMessage, QueueReceiver};

const EVENT_BODY: &str = r#"{
    "context": {"name": "transcode", "eventId": "e1", "correlationId": "c1", "parentEventId": "p1"},
    "type": "file_downloaded",
    "data": []
}"#;

const JOB_ID: &str = "host-a-transcode";

#[derive(Default)]
struct FakeBatch {
    pool_state: Mutex<Option<String>>,
    job_state: Mutex<Option<String>>,
    pools_added: Mutex<Vec<PoolAddParameter>>,
    jobs_added: Mutex<Vec<JobAddParameter>>,
    tasks: Mutex<Vec<CloudTask>>,
    submitted: Mutex<Vec<TaskAddParameter>>,
    deleted: Mutex<Vec<String>>,
    /// `file:<path>` and `delete:<task>` in call order
    calls: Mutex<Vec<String>>,
    list_calls: AtomicUsize,
    /// Pool polls left before a newly added pool turns active
    polls_until_active: AtomicUsize,
    fail_add_task: AtomicBool,
    fail_delete: AtomicBool,
}

impl FakeBatch {
    fn ready() -> Self {
        let fake = Self::default();
        *fake.pool_state.lock() = Some("active".to_string());
        *fake.job_state.lock() = Some("active".to_string());
        fake
    }

    fn task_ids(&self) -> Vec<String> {
        self.tasks.lock().iter().map(|t| t.id.clone()).collect()
    }

    fn complete(&self, task_id: &str, exit_code: Option<i32>) {
        let mut tasks = self.tasks.lock();
        let task = tasks.iter_mut().find(|t| t.id == task_id).unwrap();
        task.state = "completed".to_string();
        task.execution_info = exit_code.map(|code| TaskExecutionInformation {
            exit_code: Some(code),
            result: Some(if code == 0 { "success" } else { "failure" }.to_string()),
        });
    }
}

#[async_trait]
impl BatchApi for FakeBatch {
    async fn get_pool(&self, pool_id: &str) -> ion_dispatcher::Result<Option<CloudPool>> {
        // let a concurrent dispatch run in between polls
        tokio::task::yield_now().await;
        let allocating = self.pool_state.lock().as_deref() == Some("creating");
        if allocating && self.polls_until_active.fetch_sub(1, Ordering::SeqCst) <= 1 {
            *self.pool_state.lock() = Some("active".to_string());
        }
        Ok(self.pool_state.lock().clone().map(|state| CloudPool {
            id: pool_id.to_string(),
            state,
            allocation_state: None,
        }))
    }

    async fn add_pool(&self, pool: &PoolAddParameter) -> ion_dispatcher::Result<()> {
        self.pools_added.lock().push(pool.clone());
        let state = if self.polls_until_active.load(Ordering::SeqCst) > 0 {
            "creating"
        } else {
            "active"
        };
        *self.pool_state.lock() = Some(state.to_string());
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> ion_dispatcher::Result<Option<CloudJob>> {
        Ok(self.job_state.lock().clone().map(|state| CloudJob {
            id: job_id.to_string(),
            state,
        }))
    }

    async fn add_job(&self, job: &JobAddParameter) -> ion_dispatcher::Result<()> {
        self.jobs_added.lock().push(job.clone());
        *self.job_state.lock() = Some("active".to_string());
        Ok(())
    }

    async fn add_task(&self, _job_id: &str, task: &TaskAddParameter) -> ion_dispatcher::Result<()> {
        if self.fail_add_task.load(Ordering::SeqCst) {
            return Err(DispatchError::Http {
                status: 500,
                body: "boom".to_string(),
            });
        }
        self.submitted.lock().push(task.clone());
        self.tasks.lock().push(CloudTask {
            id: task.id.clone(),
            display_name: task.display_name.clone(),
            state: "active".to_string(),
            execution_info: None,
        });
        Ok(())
    }

    async fn list_tasks(&self, _job_id: &str) -> ion_dispatcher::Result<Vec<CloudTask>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.tasks.lock().clone())
    }

    async fn delete_task(&self, _job_id: &str, task_id: &str) -> ion_dispatcher::Result<()> {
        self.calls.lock().push(format!("delete:{}", task_id));
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(DispatchError::Http {
                status: 503,
                body: "busy".to_string(),
            });
        }
        self.tasks.lock().retain(|t| t.id != task_id);
        self.deleted.lock().push(task_id.to_string());
        Ok(())
    }

    async fn get_task_file(
        &self,
        _job_id: &str,
        _task_id: &str,
        file_path: &str,
    ) -> ion_dispatcher::Result<Option<String>> {
        self.calls.lock().push(format!("file:{}", file_path));
        Ok(match file_path {
            "stdout.txt" => Some("Container worker exit code: 3".to_string()),
            "wd/worker.log" => Some("no such input".to_string()),
            _ => None,
        })
    }
}

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.hostname = "host-a".to_string();
    config.module_name = "transcode".to_string();
    config.job.worker_image = "registry.io/worker:1".to_string();
    config.job.handler_image = "registry.io/handler:1".to_string();
    config.job.max_running_time_mins = 10;
    config.azure_batch = Some(AzureBatchConfig {
        pool_id: "pool-1".to_string(),
        batch_account_name: "acct".to_string(),
        batch_account_location: "westeurope".to_string(),
        pool_poll_interval_secs: 0,
        pool_poll_max_attempts: 3,
        ..Default::default()
    });
    config
}

fn setup_with(
    config: &AppConfig,
    api: FakeBatch,
) -> (Arc<FakeBatch>, AzureBatchProvider, InMemoryQueue) {
    let api = Arc::new(api);
    let provider = AzureBatchProvider::new(config, api.clone()).unwrap();
    (api, provider, InMemoryQueue::new("file_downloaded.transcode"))
}

fn setup(api: FakeBatch) -> (Arc<FakeBatch>, AzureBatchProvider, InMemoryQueue) {
    setup_with(&config(), api)
}

async fn next(queue: &InMemoryQueue) -> Arc<dyn QueueMessage> {
    queue.receive().await.unwrap().expect("message")
}

#[tokio::test]
async fn test_reconcile_before_init_is_noop() {
    let (api, provider, _queue) = setup(FakeBatch::default());

    provider.reconcile().await.unwrap();

    assert!(!provider.is_ready());
    assert_eq!(api.list_calls.load(Ordering::SeqCst), 0);
    assert!(api.pools_added.lock().is_empty());
}

#[tokio::test]
async fn test_first_dispatch_creates_pool_and_job() {
    let (api, provider, queue) = setup(FakeBatch::default());
    queue.publish("m1", EVENT_BODY);
    queue.publish("m2", EVENT_BODY);

    provider.dispatch(next(&queue).await).await.unwrap();
    provider.dispatch(next(&queue).await).await.unwrap();

    assert!(provider.is_ready());
    assert_eq!(provider.job_id(), JOB_ID);

    let pools = api.pools_added.lock();
    assert_eq!(pools.len(), 1);
    assert_eq!(pools[0].id, "pool-1");
    assert_eq!(pools[0].task_slots_per_node, 1);

    let jobs = api.jobs_added.lock();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, JOB_ID);
    assert_eq!(jobs[0].pool_info.pool_id, "pool-1");

    assert_eq!(provider.in_progress_count(), 2);
}

#[tokio::test]
async fn test_existing_pool_and_job_are_reused() {
    let (api, provider, queue) = setup(FakeBatch::ready());
    queue.publish("m1", EVENT_BODY);

    provider.dispatch(next(&queue).await).await.unwrap();

    assert!(api.pools_added.lock().is_empty());
    assert!(api.jobs_added.lock().is_empty());
}

#[tokio::test]
async fn test_task_shape() {
    let (api, provider, queue) = setup(FakeBatch::ready());
    queue.publish("m1", EVENT_BODY);

    provider.dispatch(next(&queue).await).await.unwrap();

    let submitted = api.submitted.lock();
    let task = &submitted[0];
    assert_eq!(task.id, "m1-v0");
    assert_eq!(task.display_name, format!("{}:m1", JOB_ID));
    assert_eq!(task.constraints.max_wall_clock_time, "PT10M");
    assert!(task.command_line.starts_with("/bin/bash -c \"echo "));
    assert!(task.command_line.ends_with(" | base64 -d | /bin/bash\""));
}

#[tokio::test]
async fn test_exit_code_zero_accepts() {
    let (api, provider, queue) = setup(FakeBatch::ready());
    queue.publish("m1", EVENT_BODY);
    provider.dispatch(next(&queue).await).await.unwrap();
    provider.reconcile().await.unwrap();
    assert_eq!(provider.in_progress_count(), 1);

    api.complete("m1-v0", Some(0));
    provider.reconcile().await.unwrap();

    assert_eq!(queue.accepted(), vec!["m1".to_string()]);
    assert_eq!(*api.deleted.lock(), vec!["m1-v0".to_string()]);
    assert!(api.task_ids().is_empty());
    assert_eq!(provider.in_progress_count(), 0);

    provider.reconcile().await.unwrap();
    assert_eq!(queue.accepted().len(), 1);
}

#[tokio::test]
async fn test_nonzero_exit_code_rejects() {
    let (api, provider, queue) = setup(FakeBatch::ready());
    queue.publish("m1", EVENT_BODY);
    provider.dispatch(next(&queue).await).await.unwrap();

    api.complete("m1-v0", Some(127));
    provider.reconcile().await.unwrap();

    assert_eq!(queue.rejected(), vec!["m1".to_string()]);
    assert!(queue.accepted().is_empty());
    assert_eq!(provider.in_progress_count(), 0);
}

#[tokio::test]
async fn test_missing_exit_code_rejects() {
    let (api, provider, queue) = setup(FakeBatch::ready());
    queue.publish("m1", EVENT_BODY);
    provider.dispatch(next(&queue).await).await.unwrap();

    api.complete("m1-v0", None);
    provider.reconcile().await.unwrap();

    assert_eq!(queue.rejected(), vec!["m1".to_string()]);
}

#[tokio::test]
async fn test_pool_never_active_rejects() {
    let fake = FakeBatch::default();
    *fake.pool_state.lock() = Some("resizing".to_string());
    let (api, provider, queue) = setup(fake);
    queue.publish("m1", EVENT_BODY);

    let result = provider.dispatch(next(&queue).await).await;

    assert!(matches!(result, Err(DispatchError::Timeout(_))));
    assert!(!provider.is_ready());
    assert!(api.submitted.lock().is_empty());
    assert_eq!(queue.rejected(), vec!["m1".to_string()]);
    assert_eq!(provider.in_progress_count(), 0);
}

#[tokio::test]
async fn test_wrapper_job_in_unusable_state_rejects() {
    let fake = FakeBatch::ready();
    *fake.job_state.lock() = Some("terminating".to_string());
    let (_api, provider, queue) = setup(fake);
    queue.publish("m1", EVENT_BODY);

    let result = provider.dispatch(next(&queue).await).await;

    assert!(matches!(result, Err(DispatchError::Backend(_))));
    assert_eq!(queue.rejected(), vec!["m1".to_string()]);
}

#[tokio::test]
async fn test_add_task_failure_rejects() {
    let fake = FakeBatch::ready();
    fake.fail_add_task.store(true, Ordering::SeqCst);
    let (_api, provider, queue) = setup(fake);
    queue.publish("m1", EVENT_BODY);

    assert!(provider.dispatch(next(&queue).await).await.is_err());
    assert_eq!(queue.rejected(), vec!["m1".to_string()]);
    assert_eq!(provider.in_progress_count(), 0);
}

#[tokio::test]
async fn test_foreign_tasks_are_ignored() {
    let (api, provider, queue) = setup(FakeBatch::ready());
    queue.publish("m1", EVENT_BODY);
    provider.dispatch(next(&queue).await).await.unwrap();

    api.tasks.lock().push(CloudTask {
        id: "X-v0".to_string(),
        display_name: "other-job:X".to_string(),
        state: "completed".to_string(),
        execution_info: None,
    });
    provider.reconcile().await.unwrap();

    assert!(api.deleted.lock().is_empty());
    assert_eq!(api.task_ids().len(), 2);
}

#[tokio::test]
async fn test_failed_delete_is_retried() {
    let (api, provider, queue) = setup(FakeBatch::ready());
    queue.publish("m1", EVENT_BODY);
    provider.dispatch(next(&queue).await).await.unwrap();

    api.complete("m1-v0", Some(0));
    api.fail_delete.store(true, Ordering::SeqCst);
    provider.reconcile().await.unwrap();

    assert_eq!(queue.accepted(), vec!["m1".to_string()]);
    assert_eq!(api.task_ids(), vec!["m1-v0".to_string()]);

    api.fail_delete.store(false, Ordering::SeqCst);
    provider.reconcile().await.unwrap();

    assert!(api.task_ids().is_empty());
    assert_eq!(queue.accepted().len(), 1);
}

#[tokio::test]
async fn test_missing_batch_section_is_config_error() {
    let mut config = config();
    config.azure_batch = None;

    let result = AzureBatchProvider::new(&config, Arc::new(FakeBatch::default()));

    assert!(matches!(result, Err(DispatchError::Config(_))));
}

#[tokio::test]
async fn test_concurrent_first_dispatches_initialise_once() {
    let fake = FakeBatch::default();
    fake.polls_until_active.store(2, Ordering::SeqCst);
    let (api, provider, queue) = setup(fake);
    queue.publish("m1", EVENT_BODY);
    queue.publish("m2", EVENT_BODY);
    let first = next(&queue).await;
    let second = next(&queue).await;

    let (a, b) = tokio::join!(provider.dispatch(first), provider.dispatch(second));

    a.unwrap();
    b.unwrap();
    assert_eq!(api.pools_added.lock().len(), 1);
    assert_eq!(api.jobs_added.lock().len(), 1);
    assert_eq!(api.submitted.lock().len(), 2);
    assert_eq!(provider.in_progress_count(), 2);
}

#[tokio::test]
async fn test_default_pool_installs_docker() {
    let (_api, provider, _queue) = setup(FakeBatch::default());

    let pool = provider.pool_parameters();

    let start_task = pool.start_task.expect("start task");
    assert!(start_task.command_line.contains("docker"));
    assert!(start_task.wait_for_success);
    assert_eq!(start_task.user_identity.auto_user.elevation_level, "admin");
}

#[tokio::test]
async fn test_case_variant_ids_get_distinct_tasks() {
    let (api, provider, queue) = setup(FakeBatch::ready());
    queue.publish("M1", EVENT_BODY);
    queue.publish("m1", EVENT_BODY);
    provider.dispatch(next(&queue).await).await.unwrap();
    provider.dispatch(next(&queue).await).await.unwrap();

    let ids = api.task_ids();
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0].to_lowercase(), ids[1].to_lowercase());

    api.complete(&task_id("M1", 0), Some(0));
    provider.reconcile().await.unwrap();

    assert_eq!(queue.accepted(), vec!["M1".to_string()]);
    assert_eq!(provider.in_progress_count(), 1);
}

#[tokio::test]
async fn test_long_ids_sharing_prefix_do_not_collide() {
    let (api, provider, queue) = setup(FakeBatch::ready());
    let prefix = "0123456789".repeat(7);
    queue.publish(&format!("{}-first", prefix), EVENT_BODY);
    queue.publish(&format!("{}-second", prefix), EVENT_BODY);

    provider.dispatch(next(&queue).await).await.unwrap();
    provider.dispatch(next(&queue).await).await.unwrap();

    let ids = api.task_ids();
    assert_ne!(ids[0], ids[1]);
    assert!(ids.iter().all(|id| id.len() <= 64));
}

#[tokio::test]
async fn test_logs_fetched_before_delete() {
    let (api, provider, queue) = setup(FakeBatch::ready());
    queue.publish("m1", EVENT_BODY);
    provider.dispatch(next(&queue).await).await.unwrap();

    api.complete("m1-v0", Some(3));
    provider.reconcile().await.unwrap();

    assert_eq!(
        *api.calls.lock(),
        vec![
            "file:stdout.txt".to_string(),
            "file:stderr.txt".to_string(),
            "file:wd/prepare.log".to_string(),
            "file:wd/worker.log".to_string(),
            "file:wd/commit.log".to_string(),
            "delete:m1-v0".to_string(),
        ]
    );
    assert_eq!(queue.rejected(), vec!["m1".to_string()]);
}

#[tokio::test]
async fn test_log_capture_can_be_disabled() {
    let mut config = config();
    config.dispatcher.capture_logs = false;
    let (api, provider, queue) = setup_with(&config, FakeBatch::ready());
    queue.publish("m1", EVENT_BODY);
    provider.dispatch(next(&queue).await).await.unwrap();

    api.complete("m1-v0", Some(0));
    provider.reconcile().await.unwrap();

    assert_eq!(*api.calls.lock(), vec!["delete:m1-v0".to_string()]);
    assert_eq!(queue.accepted(), vec!["m1".to_string()]);
}
