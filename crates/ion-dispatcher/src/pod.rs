//! Backend-neutral description of one module execution.
//!
//! Every dispatch runs the same three containers sharing one scratch volume:
//! `prepare` (handler) and `worker` (module) in order as init containers, then
//! `commit` (handler). Providers translate this into their own resources.

use ion_common::Event;
use ion_config::AppConfig;
use serde::Serialize;

use crate::args::{self, HandlerArgs, ACTION_COMMIT, ACTION_PREPARE};

pub const PREPARE_CONTAINER: &str = "prepare";
pub const WORKER_CONTAINER: &str = "worker";
pub const COMMIT_CONTAINER: &str = "commit";

pub const SHARED_VOLUME_NAME: &str = "ionvolume";
pub const SHARED_VOLUME_PATH: &str = "/ion";

pub const SHARED_SECRET_ENV: &str = "SHARED_SECRET";
pub const HANDLER_PORT_ENV: &str = "HANDLER_PORT";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub args: Vec<String>,
    pub env: Vec<EnvVar>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModulePod {
    /// Run one after another; each must exit 0 before the next starts
    pub init_containers: Vec<ContainerSpec>,
    pub containers: Vec<ContainerSpec>,
    pub volume_name: String,
    pub mount_path: String,
}

impl ModulePod {
    pub fn all_containers(&self) -> impl Iterator<Item = &ContainerSpec> {
        self.init_containers.iter().chain(self.containers.iter())
    }
}

/// Builds a [`ModulePod`] per message from configuration read once at startup
#[derive(Debug, Clone)]
pub struct PodBuilder {
    handler_image: String,
    worker_image: String,
    handler_port: u16,
    handler_args: HandlerArgs,
    module_env: Vec<EnvVar>,
}

impl PodBuilder {
    pub fn from_config(config: &AppConfig) -> Self {
        let module_env = args::load_module_env(&config.module_config_path)
            .into_iter()
            .map(|(name, value)| EnvVar { name, value })
            .collect();

        Self {
            handler_image: config.job.handler_image.clone(),
            worker_image: config.job.worker_image.clone(),
            handler_port: config.handler.server_port,
            handler_args: HandlerArgs::from_config(config),
            module_env,
        }
    }

    /// Pod for one dispatch attempt, with a freshly generated shared secret
    pub fn build(&self, event: &Event) -> ModulePod {
        self.build_with_secret(event, &args::new_shared_secret())
    }

    pub fn build_with_secret(&self, event: &Event, shared_secret: &str) -> ModulePod {
        let mut worker_env = vec![
            EnvVar {
                name: SHARED_SECRET_ENV.to_string(),
                value: shared_secret.to_string(),
            },
            EnvVar {
                name: HANDLER_PORT_ENV.to_string(),
                value: self.handler_port.to_string(),
            },
        ];
        worker_env.extend(self.module_env.iter().cloned());

        ModulePod {
            init_containers: vec![
                ContainerSpec {
                    name: PREPARE_CONTAINER.to_string(),
                    image: self.handler_image.clone(),
                    args: self
                        .handler_args
                        .for_message(event, shared_secret, ACTION_PREPARE),
                    env: Vec::new(),
                },
                ContainerSpec {
                    name: WORKER_CONTAINER.to_string(),
                    image: self.worker_image.clone(),
                    args: Vec::new(),
                    env: worker_env,
                },
            ],
            containers: vec![ContainerSpec {
                name: COMMIT_CONTAINER.to_string(),
                image: self.handler_image.clone(),
                args: self
                    .handler_args
                    .for_message(event, shared_secret, ACTION_COMMIT),
                env: Vec::new(),
            }],
            volume_name: SHARED_VOLUME_NAME.to_string(),
            mount_path: SHARED_VOLUME_PATH.to_string(),
        }
    }
}
