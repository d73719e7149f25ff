//! Docker implementation of the runtime gateway, via bollard.

use crate::error::GatewayError;
use crate::runtime::{Resource, ResourceState, ResourceStats, RunSpec, RuntimeGateway};
use crate::{BOT_LABEL, MANAGED_LABEL};
use async_trait::async_trait;
use bollard::Docker;
use bollard::errors::Error as BollardError;
use bollard::models::{
    ContainerCreateBody, ContainerStateStatusEnum, ContainerSummaryStateEnum, HostConfig,
    RestartPolicy, RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    BuildImageOptionsBuilder, CreateContainerOptionsBuilder, InspectContainerOptions,
    ListContainersOptionsBuilder, RemoveContainerOptionsBuilder, StartContainerOptions,
    StatsOptionsBuilder, StopContainerOptionsBuilder,
};
use futures::StreamExt as _;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Runtime gateway backed by a local Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerGateway {
    docker: Docker,
}

impl DockerGateway {
    /// Connect to the local Docker daemon with default settings.
    pub fn connect() -> Result<Self, GatewayError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|error| GatewayError::Connect(error.to_string()))?;
        Ok(Self { docker })
    }

    fn labels(spec: &RunSpec) -> HashMap<String, String> {
        HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (BOT_LABEL.to_string(), spec.bot.clone()),
        ])
    }
}

#[async_trait]
impl RuntimeGateway for DockerGateway {
    async fn build(&self, spec: &RunSpec) -> Result<(), GatewayError> {
        let context = tar_context(spec.context_dir.clone())
            .await
            .map_err(|error| GatewayError::Build {
                target: spec.image.clone(),
                message: error.to_string(),
            })?;

        let options = BuildImageOptionsBuilder::new()
            .t(&spec.image)
            .dockerfile(&spec.dockerfile)
            .rm(true)
            .build();

        let mut stream =
            self.docker
                .build_image(options, None, Some(bollard::body_full(context.into())));

        while let Some(info) = stream.next().await {
            let info = info.map_err(|error| GatewayError::Build {
                target: spec.image.clone(),
                message: error.to_string(),
            })?;
            if let Some(message) = info.error {
                return Err(GatewayError::Build {
                    target: spec.image.clone(),
                    message,
                });
            }
        }

        Ok(())
    }

    async fn run(&self, spec: &RunSpec) -> Result<(), GatewayError> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();

        let restart_policy = spec.auto_restart.then(|| RestartPolicy {
            name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
            maximum_retry_count: None,
        });

        let logs_dir = spec.context_dir.join("logs");
        let binds = vec![format!("{}:/app/logs", logs_dir.to_string_lossy())];

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: Some(env),
            labels: Some(Self::labels(spec)),
            host_config: Some(HostConfig {
                binds: Some(binds),
                restart_policy,
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        self.docker
            .create_container(
                Some(
                    CreateContainerOptionsBuilder::new()
                        .name(&spec.container)
                        .build(),
                ),
                body,
            )
            .await
            .map_err(|error| operation_error("create_container", &spec.container, error))?;

        self.docker
            .start_container(&spec.container, None::<StartContainerOptions>)
            .await
            .map_err(|error| operation_error("start_container", &spec.container, error))?;

        Ok(())
    }

    async fn get(&self, container: &str) -> Result<Resource, GatewayError> {
        let response = self
            .docker
            .inspect_container(container, None::<InspectContainerOptions>)
            .await
            .map_err(|error| map_not_found(container, "inspect_container", error))?;

        let state = response.state.as_ref();
        let status = state.and_then(|s| s.status);
        let exit_code = state.and_then(|s| s.exit_code);

        Ok(Resource {
            name: container.trim_start_matches('/').to_string(),
            state: map_inspect_state(status),
            exit_code,
        })
    }

    async fn stop(&self, container: &str, timeout_secs: i32) -> Result<(), GatewayError> {
        self.docker
            .stop_container(
                container,
                Some(StopContainerOptionsBuilder::new().t(timeout_secs).build()),
            )
            .await
            .map_err(|error| map_not_found(container, "stop_container", error))
    }

    async fn remove(&self, container: &str, force: bool) -> Result<(), GatewayError> {
        self.docker
            .remove_container(
                container,
                Some(
                    RemoveContainerOptionsBuilder::new()
                        .force(force)
                        .v(true)
                        .build(),
                ),
            )
            .await
            .map_err(|error| map_not_found(container, "remove_container", error))
    }

    async fn list_managed(&self, all: bool) -> Result<Vec<Resource>, GatewayError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{MANAGED_LABEL}=true")],
        )]);

        let options = ListContainersOptionsBuilder::new()
            .all(all)
            .filters(&filters)
            .build();

        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|error| operation_error("list_containers", "managed", error))?;

        Ok(summaries
            .into_iter()
            .filter_map(|summary| {
                let name = summary
                    .names
                    .as_ref()
                    .and_then(|names| names.first())
                    .map(|n| n.trim_start_matches('/').to_string())?;
                Some(Resource {
                    name,
                    state: map_summary_state(summary.state),
                    // The list endpoint does not report exit codes; callers
                    // inspect the container when they need one.
                    exit_code: None,
                })
            })
            .collect())
    }

    async fn stats(&self, container: &str) -> Result<ResourceStats, GatewayError> {
        let options = StatsOptionsBuilder::new().stream(false).build();
        let mut stream = self.docker.stats(container, Some(options));

        let snapshot = match stream.next().await {
            Some(Ok(snapshot)) => snapshot,
            Some(Err(error)) => return Err(map_not_found(container, "stats", error)),
            None => {
                return Err(GatewayError::Operation {
                    operation: "stats",
                    target: container.to_string(),
                    message: "empty stats stream".to_string(),
                });
            }
        };

        let cpu = snapshot.cpu_stats.as_ref();
        let precpu = snapshot.precpu_stats.as_ref();
        let total = cpu
            .and_then(|s| s.cpu_usage.as_ref())
            .and_then(|u| u.total_usage)
            .unwrap_or(0);
        let pre_total = precpu
            .and_then(|s| s.cpu_usage.as_ref())
            .and_then(|u| u.total_usage)
            .unwrap_or(0);
        let system = cpu.and_then(|s| s.system_cpu_usage).unwrap_or(0);
        let pre_system = precpu.and_then(|s| s.system_cpu_usage).unwrap_or(0);

        let cpu_percent = if system > pre_system {
            (total.saturating_sub(pre_total)) as f64 / (system - pre_system) as f64 * 100.0
        } else {
            0.0
        };

        let memory = snapshot.memory_stats.as_ref();
        let usage = memory.and_then(|m| m.usage).unwrap_or(0);
        let limit = memory.and_then(|m| m.limit).unwrap_or(0);
        let memory_percent = if limit > 0 {
            usage as f64 / limit as f64 * 100.0
        } else {
            0.0
        };

        Ok(ResourceStats {
            cpu_percent,
            memory_mb: usage as f64 / 1024.0 / 1024.0,
            memory_percent,
        })
    }
}

/// Tar up a build context directory in a blocking task.
async fn tar_context(dir: PathBuf) -> anyhow::Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || build_tar(&dir)).await?
}

fn build_tar(dir: &Path) -> anyhow::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all(".", dir)?;
    Ok(builder.into_inner()?)
}

fn is_not_found_error(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn map_not_found(container: &str, operation: &'static str, error: BollardError) -> GatewayError {
    if is_not_found_error(&error) {
        GatewayError::NotFound {
            name: container.to_string(),
        }
    } else {
        operation_error(operation, container, error)
    }
}

fn operation_error(operation: &'static str, target: &str, error: BollardError) -> GatewayError {
    GatewayError::Operation {
        operation,
        target: target.to_string(),
        message: error.to_string(),
    }
}

fn map_inspect_state(status: Option<ContainerStateStatusEnum>) -> ResourceState {
    match status {
        Some(ContainerStateStatusEnum::RUNNING) => ResourceState::Running,
        Some(ContainerStateStatusEnum::EXITED) => ResourceState::Exited,
        Some(ContainerStateStatusEnum::DEAD) => ResourceState::Dead,
        _ => ResourceState::Other,
    }
}

fn map_summary_state(state: Option<ContainerSummaryStateEnum>) -> ResourceState {
    match state {
        Some(ContainerSummaryStateEnum::RUNNING) => ResourceState::Running,
        Some(ContainerSummaryStateEnum::EXITED) => ResourceState::Exited,
        Some(ContainerSummaryStateEnum::DEAD) => ResourceState::Dead,
        _ => ResourceState::Other,
    }
}
