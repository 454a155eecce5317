// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Backing emulator containers and their readiness probes.
//!
//! Three third-party emulators back the gateway: an object store (`s3`), a
//! queue service (`sqs`) and a generic cloud-API emulator (`moto`). They are
//! started in [`BackingService::STARTUP_ORDER`] and each must answer its
//! readiness probe before startup continues.

use std::path::Path;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::config::{Config, ServiceConfig};
use crate::docker::ContainerSpec;
use crate::error::{NimbusError, NimbusResult};

/// Interval between readiness probe attempts.
const PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// A backing emulator managed by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackingService {
    S3,
    Sqs,
    Moto,
}

impl BackingService {
    /// Start order; shutdown runs in reverse.
    pub const STARTUP_ORDER: [BackingService; 3] = [Self::S3, Self::Sqs, Self::Moto];

    /// Logical container name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::S3 => "s3",
            Self::Sqs => "sqs",
            Self::Moto => "moto",
        }
    }

    pub fn settings<'a>(&self, config: &'a Config) -> &'a ServiceConfig {
        match self {
            Self::S3 => &config.s3,
            Self::Sqs => &config.sqs,
            Self::Moto => &config.moto,
        }
    }

    /// Container definition for this service.
    ///
    /// For `sqs` this also writes the emulator's configuration file if it
    /// does not exist yet.
    pub fn container_spec(&self, config: &Config) -> NimbusResult<ContainerSpec> {
        let settings = self.settings(config);
        let port = settings.port.value();
        let data = config.data_path.join(self.name());
        let spec = ContainerSpec::new(self.name(), &settings.image).mount(data, "/data", false);

        let spec = match self {
            Self::S3 => spec.port(9000, port).port(9001, port.saturating_add(1)),
            Self::Sqs => {
                let conf = config.data_path.join("sqs.conf");
                write_sqs_config(config, &conf)?;
                spec.mount_file(conf, "/opt/elasticmq.conf")
                    .port(9324, port)
                    .port(9325, port.saturating_add(1))
            }
            Self::Moto => spec.port(5000, port),
        };
        Ok(spec)
    }

    /// URL polled until the service answers.
    pub fn readiness_url(&self, config: &Config) -> String {
        let base = self.settings(config).base_url();
        match self {
            Self::S3 => format!("{base}/minio/health/live"),
            Self::Sqs => format!("{base}/?Action=ListQueues"),
            Self::Moto => format!("{base}/moto-api/"),
        }
    }
}

/// Write the queue emulator configuration to `path` unless it already
/// exists. Returns whether the file was written.
pub fn write_sqs_config(config: &Config, path: &Path) -> NimbusResult<bool> {
    if path.is_dir() {
        return Err(NimbusError::io(
            format!("writing {}", path.display()),
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "expected a file but found a directory",
            ),
        ));
    }
    if path.exists() {
        tracing::debug!(path = %path.display(), "Queue emulator config already present");
        return Ok(false);
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| NimbusError::io(format!("creating {}", parent.display()), e))?;
    }

    let contents = format!(
        "include classpath(\"application.conf\")\n\
         \n\
         messages-storage {{\n  enabled = true\n}}\n\
         \n\
         aws {{\n  region = {}\n  accountId = {}\n}}\n",
        config.region, config.account_number
    );
    std::fs::write(path, contents)
        .map_err(|e| NimbusError::io(format!("writing {}", path.display()), e))?;

    tracing::info!(path = %path.display(), "Wrote queue emulator config");
    Ok(true)
}

/// Spawn a task that polls `url` until it gets any HTTP response, then
/// fires the returned one-shot signal.
///
/// The task ends when the receiver is dropped.
pub fn spawn_probe(client: reqwest::Client, url: String) -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let mut attempts = 0u32;
        loop {
            if tx.is_closed() {
                return;
            }
            attempts += 1;
            match client.get(&url).send().await {
                Ok(response) => {
                    tracing::debug!(url = %url, status = %response.status(), attempts, "Probe answered");
                    let _ = tx.send(());
                    return;
                }
                Err(e) => {
                    tracing::trace!(url = %url, error = %e, "Probe not ready");
                }
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
    });

    rx
}

/// Wait for `container` to answer at `url`, failing after `timeout`.
pub async fn await_ready(
    client: &reqwest::Client,
    container: &str,
    url: &str,
    timeout: Duration,
) -> NimbusResult<()> {
    let ready = spawn_probe(client.clone(), url.to_string());

    match tokio::time::timeout(timeout, ready).await {
        Ok(Ok(())) => {
            tracing::info!(container = %container, "Container ready");
            Ok(())
        }
        // Timed out, or the probe task died without signalling.
        Ok(Err(_)) | Err(_) => Err(NimbusError::ReadinessTimeout {
            container: container.to_string(),
            waited_secs: timeout.as_secs(),
        }),
    }
}
