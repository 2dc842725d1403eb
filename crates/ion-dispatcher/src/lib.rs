//! Ion Dispatcher
//!
//! Turns queue messages into module executions on a compute backend and
//! backend outcomes into queue accept/reject decisions:
//! - Provider: scheduling interface implemented per backend
//! - KubernetesProvider: one Job per delivery attempt
//! - AzureBatchProvider: one Task per delivery attempt, pod rendered as a docker script
//! - PodBuilder / HandlerArgs: the prepare → worker → commit container set
//! - Dispatcher: ingestion and reconciliation loops

pub mod args;
pub mod azure_batch;
pub mod dispatcher;
pub mod error;
mod http;
pub mod in_flight;
pub mod kubernetes;
pub mod logs;
pub mod naming;
pub mod pod;
pub mod provider;

pub use azure_batch::{AzureBatchProvider, BatchApi, BatchClient};
pub use dispatcher::{select_provider, Dispatcher, DispatcherConfig, MessageOutcome};
pub use error::DispatchError;
pub use kubernetes::{JobsApi, KubeClient, KubernetesProvider};
pub use logs::{ContainerLog, LogCapture};
pub use pod::{ModulePod, PodBuilder};
pub use provider::Provider;

pub type Result<T> = std::result::Result<T, DispatchError>;
