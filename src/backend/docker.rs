//! Docker container backend.
//!
//! Every job gets its own ephemeral container: created with the job's bind
//! mounts and memory limit, started detached, awaited through the engine's
//! wait endpoint, and force-removed afterwards. Output artifacts are written
//! by the job itself into its bind-mounted `/output` directory, so the only
//! thing copied out before removal is the container log.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, KillContainerOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use futures::StreamExt;
use tracing::{debug, warn};

use super::{Backend, BackendError, BackendResult, Instance, InstanceExit};
use crate::config::DockerConfig;
use crate::job::JobDescriptor;

/// Label attached to every container so leftovers can be found by run.
pub const RUN_LABEL: &str = "compiler-judge.run";

/// Local container backend.
pub struct DockerBackend {
    docker: Docker,
    run_id: String,
}

impl DockerBackend {
    /// Connects to the engine named in the configuration, or to the local
    /// socket when no host is configured.
    pub fn new(config: &DockerConfig, run_id: impl Into<String>) -> BackendResult<Self> {
        let docker = if let Some(host) = &config.host {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| BackendError::Connection(e.to_string()))?
        } else {
            Docker::connect_with_local_defaults()
                .map_err(|e| BackendError::Connection(e.to_string()))?
        };

        Ok(Self {
            docker,
            run_id: run_id.into(),
        })
    }
}

#[async_trait]
impl Backend for DockerBackend {
    type Instance = DockerInstance;

    async fn start(&self, job: &JobDescriptor) -> BackendResult<DockerInstance> {
        let host_config = bollard::models::HostConfig {
            binds: Some(job.binds()),
            memory: job.memory_limit,
            ..Default::default()
        };

        let labels = HashMap::from([(RUN_LABEL.to_string(), self.run_id.clone())]);

        let container_config = ContainerConfig {
            image: Some(job.image.clone()),
            cmd: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                job.command.clone(),
            ]),
            working_dir: Some(job.working_dir.clone()),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: job.instance_name.as_str(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| BackendError::StartFailed(e.to_string()))?;

        let container_id = response.id;

        if let Err(e) = self
            .docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            // Created but never started: reclaim it here, nobody else holds it.
            let remove = self
                .docker
                .remove_container(
                    &container_id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            if let Err(remove_err) = remove {
                warn!(
                    "Failed to remove unstarted container {}: {}",
                    job.instance_name, remove_err
                );
            }
            return Err(BackendError::StartFailed(e.to_string()));
        }

        debug!("Started container {} ({})", job.instance_name, container_id);

        Ok(DockerInstance {
            name: job.instance_name.clone(),
            container_id,
            docker: self.docker.clone(),
        })
    }

    fn name(&self) -> &str {
        "docker"
    }
}

/// A running (or exited) container owned by one job.
pub struct DockerInstance {
    name: String,
    container_id: String,
    docker: Docker,
}

#[async_trait]
impl Instance for DockerInstance {
    fn id(&self) -> &str {
        &self.name
    }

    async fn wait(&self) -> BackendResult<InstanceExit> {
        let mut stream = self.docker.wait_container(
            &self.container_id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );

        match stream.next().await {
            Some(Ok(response)) => Ok(InstanceExit {
                status_code: response.status_code,
                error: response.error.and_then(|e| e.message).filter(|m| !m.is_empty()),
            }),
            // The engine client surfaces a non-zero exit as an error value;
            // it still carries the program's code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { error, code })) => {
                Ok(InstanceExit {
                    status_code: code,
                    error: Some(error).filter(|m| !m.is_empty()),
                })
            }
            Some(Err(e)) => Err(BackendError::WaitFailed(e.to_string())),
            None => Err(BackendError::WaitFailed(
                "wait stream ended without a status".to_string(),
            )),
        }
    }

    async fn kill(&self) -> BackendResult<()> {
        self.docker
            .kill_container(&self.container_id, None::<KillContainerOptions<String>>)
            .await
            .map_err(|e| BackendError::KillFailed(e.to_string()))
    }

    async fn collect_output(&self, stdout: &Path, stderr: &Path) -> BackendResult<()> {
        let mut logs = self.docker.logs(
            &self.container_id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: "all".to_string(),
                ..Default::default()
            }),
        );

        let mut out = Vec::new();
        let mut err = Vec::new();
        while let Some(chunk) = logs.next().await {
            match chunk.map_err(|e| BackendError::TransferFailed(e.to_string()))? {
                LogOutput::StdOut { message } => out.extend_from_slice(&message),
                LogOutput::StdErr { message } => err.extend_from_slice(&message),
                _ => {}
            }
        }

        tokio::fs::write(stdout, out).await?;
        tokio::fs::write(stderr, err).await?;
        Ok(())
    }

    async fn remove(&self) -> BackendResult<()> {
        self.docker
            .remove_container(
                &self.container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| BackendError::RemoveFailed(e.to_string()))
    }
}
