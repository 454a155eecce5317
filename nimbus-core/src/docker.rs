// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Container lifecycle management.
//!
//! [`ContainerRuntime`] is the narrow seam over the container engine's
//! control API; [`BollardRuntime`] talks to the local Docker daemon. The
//! [`Orchestrator`] tracks everything it started by logical name so it can
//! tear it down again in reverse start order.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, HostConfig, Mount, MountTypeEnum, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{ContainerError, ShutdownError};

/// A host path bind-mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
    /// Directories are created on demand; files must already exist.
    pub file: bool,
}

/// Container port published on a host port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub container: u16,
    pub host: u16,
}

/// Everything needed to create and start a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Logical name; also used as the container name.
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub mounts: Vec<MountSpec>,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<PortMapping>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    pub fn mount(mut self, source: impl Into<PathBuf>, target: impl Into<String>, read_only: bool) -> Self {
        self.mounts.push(MountSpec {
            source: source.into(),
            target: target.into(),
            read_only,
            file: false,
        });
        self
    }

    pub fn mount_file(mut self, source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        self.mounts.push(MountSpec {
            source: source.into(),
            target: target.into(),
            read_only: true,
            file: true,
        });
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn port(mut self, container: u16, host: u16) -> Self {
        self.ports.push(PortMapping { container, host });
        self
    }

    /// Create every directory mount source that does not exist yet.
    fn prepare_mounts(&self) -> Result<(), ContainerError> {
        for mount in &self.mounts {
            if mount.file {
                if !mount.source.is_file() {
                    return Err(ContainerError::MountNotFile {
                        path: mount.source.clone(),
                    });
                }
                continue;
            }
            if mount.source.exists() {
                if !mount.source.is_dir() {
                    return Err(ContainerError::MountNotDirectory {
                        path: mount.source.clone(),
                    });
                }
                continue;
            }
            std::fs::create_dir_all(&mount.source).map_err(|source| ContainerError::MountCreate {
                path: mount.source.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

/// Handle to a container started by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub name: String,
    pub id: String,
}

/// Control API of a container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull `image` unless it is already present locally.
    async fn ensure_image(&self, image: &str) -> Result<(), ContainerError>;

    /// Create and start a container, returning its engine id.
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, ContainerError>;

    /// Stop a container, waiting at most `grace` before it is killed.
    async fn stop(&self, id: &str, grace: Duration) -> Result<(), ContainerError>;

    /// Remove a (stopped) container.
    async fn remove(&self, id: &str) -> Result<(), ContainerError>;

    /// Follow stdout and stderr of a container, one line per item.
    fn logs(&self, id: &str) -> BoxStream<'static, Result<String, ContainerError>>;
}

/// [`ContainerRuntime`] backed by the local Docker daemon.
#[derive(Debug, Clone)]
pub struct BollardRuntime {
    docker: Docker,
}

impl BollardRuntime {
    /// Connect using the platform's default socket.
    pub fn connect() -> Result<Self, ContainerError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| ContainerError::Create {
            name: "docker".to_string(),
            reason: format!("unable to connect to Docker: {e}"),
        })?;
        Ok(Self { docker })
    }

    async fn image_exists(&self, image: &str) -> Result<bool, ContainerError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(ContainerError::ImagePull {
                image: image.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn create_body(spec: &ContainerSpec) -> ContainerCreateBody {
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let mounts: Vec<Mount> = spec
            .mounts
            .iter()
            .map(|mount| Mount {
                target: Some(mount.target.clone()),
                source: Some(mount.source.display().to_string()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(mount.read_only),
                ..Default::default()
            })
            .collect();

        let mut port_bindings = std::collections::HashMap::new();
        for mapping in &spec.ports {
            port_bindings.insert(
                format!("{}/tcp", mapping.container),
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: Some(mapping.host.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            mounts: Some(mounts),
            port_bindings: Some(port_bindings),
            ..Default::default()
        };

        ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: if spec.command.is_empty() {
                None
            } else {
                Some(spec.command.clone())
            },
            env: Some(env),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for BollardRuntime {
    async fn ensure_image(&self, image: &str) -> Result<(), ContainerError> {
        if self.image_exists(image).await? {
            tracing::debug!(image = %image, "Image already present");
            return Ok(());
        }

        tracing::info!(image = %image, "Pulling image");
        let start = Instant::now();

        let options = CreateImageOptions {
            from_image: Some(image.to_string()),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        tracing::info!(
                            image = %image,
                            id = info.id.as_deref().unwrap_or(""),
                            status = %status,
                            progress = info.progress.as_deref().unwrap_or(""),
                            "Pull progress"
                        );
                    }
                }
                Err(e) => {
                    tracing::error!(image = %image, error = %e, "Image pull failed");
                    return Err(ContainerError::ImagePull {
                        image: image.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            image = %image,
            duration_ms = start.elapsed().as_millis() as u64,
            "Image pulled"
        );
        Ok(())
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
        let create = || {
            self.docker.create_container(
                Some(CreateContainerOptions {
                    name: Some(spec.name.clone()),
                    platform: String::new(),
                }),
                Self::create_body(spec),
            )
        };

        let created = match create().await {
            Ok(created) => created,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => {
                // Left behind by a previous run that did not shut down cleanly.
                tracing::warn!(container = %spec.name, "Removing stale container");
                self.remove(&spec.name).await?;
                create().await.map_err(|e| ContainerError::Create {
                    name: spec.name.clone(),
                    reason: e.to_string(),
                })?
            }
            Err(e) => {
                return Err(ContainerError::Create {
                    name: spec.name.clone(),
                    reason: e.to_string(),
                })
            }
        };

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
        {
            if let Err(cleanup) = self.remove(&created.id).await {
                tracing::warn!(container = %spec.name, error = %cleanup, "Unable to remove container that failed to start");
            }
            return Err(ContainerError::Start {
                name: spec.name.clone(),
                reason: e.to_string(),
            });
        }

        Ok(created.id)
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), ContainerError> {
        let options = StopContainerOptions {
            t: Some(grace.as_secs().min(i32::MAX as u64) as i32),
            ..Default::default()
        };
        match self.docker.stop_container(id, Some(options)).await {
            // 304: already stopped.
            Ok(()) | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(ContainerError::Stop {
                name: id.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), ContainerError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| ContainerError::Remove {
                name: id.to_string(),
                reason: e.to_string(),
            })
    }

    fn logs(&self, id: &str) -> BoxStream<'static, Result<String, ContainerError>> {
        let options = LogsOptions {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let name = id.to_string();
        self.docker
            .logs(id, Some(options))
            .map(move |item| match item {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => {
                    Ok(String::from_utf8_lossy(&message).trim_end().to_string())
                }
                Ok(LogOutput::StdIn { .. }) => Ok(String::new()),
                Err(e) => Err(ContainerError::Logs {
                    name: name.clone(),
                    reason: e.to_string(),
                }),
            })
            .boxed()
    }
}

struct RunningContainer {
    handle: ContainerHandle,
    /// Cancels the detached log stream.
    logs: CancellationToken,
}

enum Slot {
    /// Reserved while the engine creates the container.
    Starting,
    Running(RunningContainer),
}

/// Tracked containers in start order.
type Tracked = Mutex<Vec<(String, Slot)>>;

fn lock(tracked: &Tracked) -> MutexGuard<'_, Vec<(String, Slot)>> {
    tracked.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Remove the running record for `name`, if there is one.
fn take_running(tracked: &Tracked, name: &str) -> Option<RunningContainer> {
    let mut running = lock(tracked);
    let index = running
        .iter()
        .position(|(n, slot)| n == name && matches!(slot, Slot::Running(_)))?;
    match running.remove(index).1 {
        Slot::Running(container) => Some(container),
        Slot::Starting => None,
    }
}

/// Starts, tracks and tears down containers by logical name.
pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    stop_grace: Duration,
    /// Start order is preserved so shutdown can run in reverse.
    running: Arc<Tracked>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("stop_grace", &self.stop_grace)
            .field("running", &self.running_names())
            .finish()
    }
}

impl Orchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, stop_grace: Duration) -> Self {
        Self {
            runtime,
            stop_grace,
            running: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn ensure_image(&self, image: &str) -> Result<(), ContainerError> {
        self.runtime.ensure_image(image).await
    }

    /// Create and start a container, record it and follow its logs.
    ///
    /// The engine work runs in its own task. If the caller stops waiting,
    /// the task still finishes and then removes the container it created,
    /// so the name is never left reserved.
    pub async fn start(&self, spec: ContainerSpec) -> Result<ContainerHandle, ContainerError> {
        {
            let mut running = lock(&self.running);
            if running.iter().any(|(name, _)| name == &spec.name) {
                return Err(ContainerError::AlreadyRunning { name: spec.name });
            }
            running.push((spec.name.clone(), Slot::Starting));
        }

        let name = spec.name.clone();
        let runtime = Arc::clone(&self.runtime);
        let running = Arc::clone(&self.running);
        let stop_grace = self.stop_grace;
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let result = start_tracked(&runtime, &running, stop_grace, spec).await;
            if let Err(Ok(handle)) = tx.send(result) {
                tracing::warn!(container = %handle.name, "Start abandoned by caller, removing container");
                if let Some(container) = take_running(&running, &handle.name) {
                    if let Err(e) = teardown(runtime.as_ref(), stop_grace, container).await {
                        tracing::error!(container = %handle.name, error = %e, "Removing abandoned container failed");
                    }
                }
            }
        });

        rx.await.map_err(|_| ContainerError::Start {
            name,
            reason: "start task ended without a result".to_string(),
        })?
    }

    /// Stop and remove the container registered under `name`.
    ///
    /// The record is forgotten even when stopping fails; removal is still
    /// attempted and the first error is returned.
    pub async fn stop(&self, name: &str) -> Result<(), ContainerError> {
        let container = take_running(&self.running, name).ok_or_else(|| ContainerError::NotRunning {
            name: name.to_string(),
        })?;
        teardown(self.runtime.as_ref(), self.stop_grace, container).await
    }

    pub fn is_running(&self, name: &str) -> bool {
        lock(&self.running)
            .iter()
            .any(|(n, slot)| n == name && matches!(slot, Slot::Running(_)))
    }

    /// Logical names of running containers in start order.
    pub fn running_names(&self) -> Vec<String> {
        lock(&self.running)
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Running(_)))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Stop every tracked container, newest first, collecting every failure.
    ///
    /// Reservations for containers still being created are dropped too; their
    /// start removes the container once the engine returns.
    pub async fn shutdown_all(&self) -> Result<(), ShutdownError> {
        let containers: Vec<RunningContainer> = {
            let mut running = lock(&self.running);
            let mut taken = Vec::new();
            for (_, slot) in running.drain(..).rev() {
                if let Slot::Running(container) = slot {
                    taken.push(container);
                }
            }
            taken
        };

        tracing::info!(count = containers.len(), "Shutting down containers");

        let mut failures = Vec::new();
        for container in containers {
            let name = container.handle.name.clone();
            if let Err(e) = teardown(self.runtime.as_ref(), self.stop_grace, container).await {
                tracing::error!(container = %name, error = %e, "Container shutdown failed");
                failures.push((name, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ShutdownError { failures })
        }
    }
}

/// Create the container reserved under `spec.name` and promote the
/// reservation to a running record.
async fn start_tracked(
    runtime: &Arc<dyn ContainerRuntime>,
    tracked: &Tracked,
    stop_grace: Duration,
    spec: ContainerSpec,
) -> Result<ContainerHandle, ContainerError> {
    let created = match spec.prepare_mounts() {
        Ok(()) => runtime.create_and_start(&spec).await,
        Err(e) => Err(e),
    };
    let id = match created {
        Ok(id) => id,
        Err(e) => {
            lock(tracked).retain(|(name, slot)| !(name == &spec.name && matches!(slot, Slot::Starting)));
            return Err(e);
        }
    };

    let handle = ContainerHandle {
        name: spec.name.clone(),
        id,
    };
    let logs = CancellationToken::new();

    let committed = {
        let mut running = lock(tracked);
        match running
            .iter_mut()
            .find(|(name, slot)| name == &spec.name && matches!(slot, Slot::Starting))
        {
            Some((_, slot)) => {
                *slot = Slot::Running(RunningContainer {
                    handle: handle.clone(),
                    logs: logs.clone(),
                });
                true
            }
            None => false,
        }
    };

    if !committed {
        // Shutdown drained the reservation while the engine was busy.
        tracing::warn!(container = %handle.name, "Orchestrator shut down during start, removing container");
        teardown(runtime.as_ref(), stop_grace, RunningContainer { handle, logs }).await?;
        return Err(ContainerError::Start {
            name: spec.name,
            reason: "orchestrator shut down during start".to_string(),
        });
    }

    follow_logs(runtime.as_ref(), &handle, logs);
    tracing::info!(container = %handle.name, id = %handle.id, image = %spec.image, "Container started");
    Ok(handle)
}

/// Forward container output to the log sink until cancelled or the stream
/// ends. Runs detached from the caller.
fn follow_logs(runtime: &dyn ContainerRuntime, handle: &ContainerHandle, token: CancellationToken) {
    let mut stream = runtime.logs(&handle.id);
    let container = handle.name.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(line)) if line.is_empty() => {}
                    Some(Ok(line)) => tracing::info!(container = %container, "{}", line),
                    Some(Err(e)) => {
                        tracing::warn!(container = %container, error = %e, "Log stream failed");
                        break;
                    }
                    None => break,
                },
            }
        }
        tracing::debug!(container = %container, "Log stream closed");
    });
}

async fn teardown(
    runtime: &dyn ContainerRuntime,
    stop_grace: Duration,
    container: RunningContainer,
) -> Result<(), ContainerError> {
    container.logs.cancel();
    let handle = container.handle;

    let stopped = runtime.stop(&handle.id, stop_grace).await;
    if let Err(e) = &stopped {
        tracing::warn!(container = %handle.name, error = %e, "Stop failed, removing anyway");
    }
    let removed = runtime.remove(&handle.id).await;

    match (stopped, removed) {
        (Ok(()), Ok(())) => {
            tracing::info!(container = %handle.name, "Container stopped");
            Ok(())
        }
        (Err(e), _) | (Ok(()), Err(e)) => Err(e),
    }
}
