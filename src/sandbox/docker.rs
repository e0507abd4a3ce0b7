//! Docker implementation of the sandbox backend capability set.
//!
//! Containers are provisioned from committed images, kept alive with a
//! `sleep infinity` entrypoint, and snapshotted with `docker commit`.
//! File transfer goes through the container archive API as in-memory
//! tar streams.

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, DownloadFromContainerOptions, LogOutput,
    RemoveContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CommitContainerOptions;
use bollard::Docker;
use bytes::Bytes;
use futures_util::StreamExt;
use std::io::Read;
use tracing::{debug, warn};

use super::{ExecOutput, SandboxBackend, SandboxConfig, SandboxError};

/// Sandbox backend backed by a local Docker daemon.
pub struct DockerBackend {
    docker: Docker,
}

impl DockerBackend {
    /// Connects to the local Docker daemon and verifies it responds.
    pub async fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            SandboxError::backend_unavailable(format!("cannot connect to Docker: {e}"))
        })?;

        docker.ping().await.map_err(|e| {
            SandboxError::backend_unavailable(format!("cannot ping Docker daemon: {e}"))
        })?;

        Ok(Self { docker })
    }

    fn container_config(image_id: &str, config: &SandboxConfig) -> ContainerConfig<String> {
        // i64 cast is safe for any realistic memory/cpu allocation.
        #[allow(clippy::cast_possible_wrap)]
        let memory = (config.memory_mb * 1024 * 1024) as i64;
        let nano_cpus = i64::from(config.cpu_cores) * 1_000_000_000;

        ContainerConfig {
            image: Some(image_id.to_string()),
            working_dir: Some("/workspace".to_string()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            host_config: Some(bollard::service::HostConfig {
                memory: Some(memory),
                nano_cpus: Some(nano_cpus),
                // disk_gb needs a quota-capable storage driver; not applied here.
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn create_and_start(
        &self,
        image_id: &str,
        config: &SandboxConfig,
    ) -> Result<String, SandboxError> {
        let container_name = format!(
            "drydock-{}",
            uuid::Uuid::new_v4()
                .to_string()
                .split('-')
                .next()
                .unwrap_or("0")
        );

        debug!("Creating container: {}", container_name);
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.clone(),
                    platform: None,
                }),
                Self::container_config(image_id, config),
            )
            .await
            .map_err(backend_err)?;

        self.docker
            .start_container::<String>(&container_name, None)
            .await
            .map_err(backend_err)?;

        Ok(container_name)
    }
}

fn backend_err(e: bollard::errors::Error) -> SandboxError {
    SandboxError::backend_failed(e.to_string())
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    async fn create_from_image(
        &self,
        image_id: &str,
        config: &SandboxConfig,
    ) -> Result<String, SandboxError> {
        self.create_and_start(image_id, config).await
    }

    async fn execute_command(
        &self,
        sandbox_id: &str,
        command: &str,
    ) -> Result<ExecOutput, SandboxError> {
        let exec = self
            .docker
            .create_exec(
                sandbox_id,
                CreateExecOptions {
                    cmd: Some(vec!["/bin/sh", "-lc", command]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(backend_err)?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached {
            output: mut stream, ..
        } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(backend_err)?
        {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Err(e) => {
                        warn!("Error reading exec output: {}", e);
                    }
                    _ => {}
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await.map_err(backend_err)?;
        let exit_code = inspect.exit_code.unwrap_or(-1);

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String, SandboxError> {
        let mut stream = self.docker.download_from_container(
            sandbox_id,
            Some(DownloadFromContainerOptions { path }),
        );

        let mut archive_bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            archive_bytes.extend_from_slice(&chunk.map_err(backend_err)?);
        }

        let mut archive = tar::Archive::new(archive_bytes.as_slice());
        let entries = archive
            .entries()
            .map_err(|e| SandboxError::backend_failed(format!("invalid archive for {path}: {e}")))?;

        for entry in entries {
            let mut entry = entry
                .map_err(|e| SandboxError::backend_failed(format!("invalid entry for {path}: {e}")))?;
            if entry.header().entry_type().is_file() {
                let mut content = String::new();
                entry.read_to_string(&mut content).map_err(|e| {
                    SandboxError::backend_failed(format!("failed to read {path}: {e}"))
                })?;
                return Ok(content);
            }
        }

        Err(SandboxError::backend_failed(format!("no such file: {path}")))
    }

    async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        content: &str,
    ) -> Result<(), SandboxError> {
        let rel_path = path.trim_start_matches('/');
        if let Some(parent) = std::path::Path::new(path).parent() {
            self.execute_command(sandbox_id, &format!("mkdir -p {}", parent.display()))
                .await?;
        }

        let mut tar_buf = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut tar_buf);
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, rel_path, content.as_bytes())
                .map_err(|e| SandboxError::backend_failed(format!("tar build failed: {e}")))?;
            builder
                .finish()
                .map_err(|e| SandboxError::backend_failed(format!("tar finish failed: {e}")))?;
        }

        self.docker
            .upload_to_container(
                sandbox_id,
                Some(UploadToContainerOptions {
                    path: "/",
                    ..Default::default()
                }),
                Bytes::from(tar_buf),
            )
            .await
            .map_err(backend_err)
    }

    async fn snapshot(&self, sandbox_id: &str) -> Result<String, SandboxError> {
        let tag = uuid::Uuid::new_v4()
            .to_string()
            .split('-')
            .next()
            .unwrap_or("0")
            .to_string();

        let commit = self
            .docker
            .commit_container(
                CommitContainerOptions {
                    container: sandbox_id.to_string(),
                    repo: "drydock-snap".to_string(),
                    tag: tag.clone(),
                    ..Default::default()
                },
                ContainerConfig::<String>::default(),
            )
            .await
            .map_err(backend_err)?;

        debug!(container = sandbox_id, image = ?commit.id, "Committed snapshot");
        Ok(format!("drydock-snap:{tag}"))
    }

    async fn restore(
        &self,
        snapshot_id: &str,
        config: &SandboxConfig,
    ) -> Result<String, SandboxError> {
        match self.create_and_start(snapshot_id, config).await {
            Ok(id) => Ok(id),
            Err(SandboxError::BackendFailed { message }) if message.contains("No such image") => {
                Err(SandboxError::snapshot_not_found(snapshot_id))
            }
            Err(e) => Err(e),
        }
    }

    async fn terminate(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        debug!("Removing container: {}", sandbox_id);
        self.docker
            .remove_container(
                sandbox_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(backend_err)
    }
}
