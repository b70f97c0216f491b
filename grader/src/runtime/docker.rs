//! Local Docker daemon backend.
//!
//! The daemon offers a native blocking wait, so no polling is involved:
//! `wait` parks on the daemon's wait endpoint until the container exits.
//! Inputs are uploaded as a tar body before start; `finalize` downloads
//! each bound path back out the same way.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, KillContainerOptions,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions,
    WaitContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::NetworkPolicy;
use crate::error::RuntimeError;
use crate::runtime::{
    RuntimeBackend, RuntimeFactory, RuntimeSpec, UnitExit, UnitLifecycle, UnitState,
};

/// Allocates [`DockerBackend`] units against one daemon connection.
///
/// The `bollard` client is cheaply cloneable and safe for concurrent use,
/// so a single factory serves the whole worker pool.
#[derive(Clone, Debug)]
pub struct DockerRuntimeFactory {
    docker: Docker,
}

impl DockerRuntimeFactory {
    /// Connect to the local daemon using its default socket.
    pub fn from_local_daemon() -> Result<Self, RuntimeError> {
        Ok(Self {
            docker: Docker::connect_with_local_defaults()?,
        })
    }

    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl RuntimeFactory for DockerRuntimeFactory {
    async fn create(&self, spec: RuntimeSpec) -> Result<Box<dyn RuntimeBackend>, RuntimeError> {
        let backend = DockerBackend::create(self.docker.clone(), spec).await?;
        Ok(Box::new(backend))
    }
}

/// One container's lifecycle on the local daemon.
pub struct DockerBackend {
    docker: Docker,
    container_id: String,
    spec: RuntimeSpec,
    lifecycle: UnitLifecycle,
}

impl DockerBackend {
    /// Create the container and stage the bound input files into it.
    pub async fn create(docker: Docker, spec: RuntimeSpec) -> Result<Self, RuntimeError> {
        let name = format!("grader-{}", Uuid::new_v4().simple());
        let host_config = match spec.network {
            NetworkPolicy::Enabled => None,
            NetworkPolicy::Disabled => Some(HostConfig {
                network_mode: Some("none".to_string()),
                ..Default::default()
            }),
        };

        let created = docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                Config {
                    image: Some(spec.image.clone()),
                    cmd: Some(spec.command.clone()),
                    host_config,
                    ..Default::default()
                },
            )
            .await?;

        let tar = archive_binds(&spec)?;
        docker
            .upload_to_container(
                &created.id,
                Some(UploadToContainerOptions {
                    path: "/".to_string(),
                    ..Default::default()
                }),
                tar.into(),
            )
            .await?;

        // Short id, matching what the daemon prints.
        let short_id = created.id.chars().take(12).collect::<String>();
        debug!(container = %short_id, image = %spec.image, "container created");

        Ok(Self {
            docker,
            container_id: created.id,
            spec,
            lifecycle: UnitLifecycle::new(short_id),
        })
    }
}

#[async_trait]
impl RuntimeBackend for DockerBackend {
    async fn start(&self) -> Result<(), RuntimeError> {
        self.lifecycle.mark_running()?;
        self.docker
            .start_container(&self.container_id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn wait(&self) -> Result<UnitExit, RuntimeError> {
        if let Some(exit) = self.lifecycle.recorded_exit() {
            return Ok(exit);
        }

        let mut stream = self
            .docker
            .wait_container(&self.container_id, None::<WaitContainerOptions<String>>);
        let code = match stream.next().await {
            Some(Ok(response)) => response.status_code,
            // The daemon surfaces non-zero exits as a wait error.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(err)) => return Err(err.into()),
            None => {
                return self
                    .lifecycle
                    .recorded_exit()
                    .ok_or_else(|| RuntimeError::ApiStatus {
                        op: "wait",
                        status: 0,
                        body: "wait stream ended without a status".to_string(),
                    })
            }
        };
        Ok(self.lifecycle.mark_exited(UnitExit { code }))
    }

    async fn kill(&self) -> Result<(), RuntimeError> {
        if !self.lifecycle.mark_killed() {
            return Ok(());
        }
        match self
            .docker
            .kill_container(&self.container_id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
        {
            // Lost the race against a natural exit; the recorded state wins.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => Ok(()),
            other => Ok(other?),
        }
    }

    fn unit_id(&self) -> &str {
        self.lifecycle.unit_id()
    }

    fn state(&self) -> UnitState {
        self.lifecycle.state()
    }

    async fn logs(&self) -> Result<String, RuntimeError> {
        let mut stream = self.docker.logs(
            &self.container_id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: "all".to_string(),
                ..Default::default()
            }),
        );
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            out.push_str(&String::from_utf8_lossy(&chunk?.into_bytes()));
        }
        Ok(out)
    }

    async fn finalize(&self) -> Result<(), RuntimeError> {
        self.lifecycle.mark_finalized()?;

        for bind in &self.spec.binds {
            let chunks = self
                .docker
                .download_from_container(
                    &self.container_id,
                    Some(DownloadFromContainerOptions {
                        path: bind.remote.clone(),
                    }),
                )
                .try_collect::<Vec<_>>()
                .await?;
            let mut archive = Vec::new();
            for chunk in &chunks {
                archive.extend_from_slice(chunk);
            }
            unpack_single_file(&archive, &bind.local)?;
        }

        if self.spec.keep_unit {
            debug!(container = %self.unit_id(), "keeping container per request");
            return Ok(());
        }
        if let Err(err) = self
            .docker
            .remove_container(
                &self.container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            warn!(container = %self.unit_id(), error = %err, "container removal failed");
        }
        Ok(())
    }
}

/// Tar body with each bound local file placed at its in-unit path.
fn archive_binds(spec: &RuntimeSpec) -> Result<Vec<u8>, RuntimeError> {
    let mut builder = tar::Builder::new(Vec::new());
    for bind in &spec.binds {
        let mut file = std::fs::File::open(&bind.local)?;
        builder.append_file(bind.remote.trim_start_matches('/'), &mut file)?;
    }
    Ok(builder.into_inner()?)
}

/// Extract the first regular file of a single-path download archive.
fn unpack_single_file(tar_bytes: &[u8], dest: &std::path::Path) -> Result<(), RuntimeError> {
    let mut archive = tar::Archive::new(tar_bytes);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_file() {
            let mut out = std::fs::File::create(dest)?;
            std::io::copy(&mut entry, &mut out)?;
            return Ok(());
        }
    }
    Err(RuntimeError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("download archive for {} held no file", dest.display()),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::VolumeBinding;

    #[test]
    fn archive_binds_places_files_at_unit_paths() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("hw01.ipynb");
        std::fs::write(&local, b"cells").unwrap();

        let spec = RuntimeSpec {
            image: "grading:test".to_string(),
            command: vec!["/autograder/run_autograder".to_string()],
            binds: vec![VolumeBinding {
                local,
                remote: "/autograder/submission/hw01.ipynb".to_string(),
            }],
            network: NetworkPolicy::Enabled,
            keep_unit: false,
        };

        let bytes = archive_binds(&spec).unwrap();
        let mut archive = tar::Archive::new(bytes.as_slice());
        let paths: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| {
                e.unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert_eq!(paths, vec!["autograder/submission/hw01.ipynb".to_string()]);
    }

    #[test]
    fn unpack_single_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("results.json");
        std::fs::write(&src, b"{\"total\": 1.0}").unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        builder
            .append_file("results.json", &mut std::fs::File::open(&src).unwrap())
            .unwrap();
        let bytes = builder.into_inner().unwrap();

        let dest = dir.path().join("copied.json");
        unpack_single_file(&bytes, &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"{\"total\": 1.0}");
    }
}
