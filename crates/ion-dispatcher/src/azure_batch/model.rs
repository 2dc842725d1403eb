//! Azure Batch REST payloads (pools, jobs, tasks)

use serde::{Deserialize, Serialize};

pub const POOL_STATE_ACTIVE: &str = "active";
pub const JOB_STATE_ACTIVE: &str = "active";
pub const JOB_STATE_DELETING: &str = "deleting";
pub const TASK_STATE_COMPLETED: &str = "completed";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoUserSpecification {
    pub scope: String,
    pub elevation_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub auto_user: AutoUserSpecification,
}

impl UserIdentity {
    /// Pool-scoped admin identity; tasks need it to drive docker
    pub fn pool_admin() -> Self {
        Self {
            auto_user: AutoUserSpecification {
                scope: "pool".to_string(),
                elevation_level: "admin".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageReference {
    pub publisher: String,
    pub offer: String,
    pub sku: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineConfiguration {
    pub image_reference: ImageReference,
    #[serde(rename = "nodeAgentSKUId")]
    pub node_agent_sku_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTask {
    pub command_line: String,
    pub user_identity: UserIdentity,
    pub wait_for_success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolAddParameter {
    pub id: String,
    pub vm_size: String,
    pub virtual_machine_configuration: VirtualMachineConfiguration,
    pub target_dedicated_nodes: u32,
    pub task_slots_per_node: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_task: Option<StartTask>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudPool {
    pub id: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub allocation_state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolInformation {
    pub pool_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAddParameter {
    pub id: String,
    pub pool_info: PoolInformation,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudJob {
    pub id: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConstraints {
    /// ISO 8601 duration, e.g. `PT10M`
    pub max_wall_clock_time: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAddParameter {
    pub id: String,
    pub display_name: String,
    pub command_line: String,
    pub constraints: TaskConstraints,
    pub user_identity: UserIdentity,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecutionInformation {
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub result: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudTask {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub execution_info: Option<TaskExecutionInformation>,
}

impl CloudTask {
    pub fn exit_code(&self) -> Option<i32> {
        self.execution_info.as_ref()?.exit_code
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskListResult {
    #[serde(default)]
    pub value: Vec<CloudTask>,
    #[serde(default, rename = "odata.nextLink")]
    pub next_link: Option<String>,
}
