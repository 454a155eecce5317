// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! YAML configuration parser with strict validation.
//!
//! The raw file is deserialized with serde defaults and then validated into
//! typed settings. Any invalid field results in a HardValidationError that
//! prevents startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{HardValidationError, NimbusError, NimbusResult};
use crate::types::{Port, Runtime, MAX_TIMEOUT_SECS};

pub const DEFAULT_ACCOUNT_NUMBER: &str = "271828182845";
pub const DEFAULT_REGION: &str = "us-west-2";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default = "default_account_number")]
    account_number: String,
    #[serde(default = "default_region")]
    region: String,
    #[serde(default = "default_data_path")]
    data_path: String,
    #[serde(default)]
    gateway: RawGatewayConfig,
    #[serde(default)]
    lambda: RawLambdaConfig,
    #[serde(default = "default_moto")]
    moto: RawServiceConfig,
    #[serde(default = "default_sqs")]
    sqs: RawServiceConfig,
    #[serde(default = "default_s3")]
    s3: RawServiceConfig,
    #[serde(default)]
    timeouts: RawTimeoutConfig,
}

fn default_account_number() -> String {
    DEFAULT_ACCOUNT_NUMBER.to_string()
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

fn default_data_path() -> String {
    "data".to_string()
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            account_number: default_account_number(),
            region: default_region(),
            data_path: default_data_path(),
            gateway: RawGatewayConfig::default(),
            lambda: RawLambdaConfig::default(),
            moto: default_moto(),
            sqs: default_sqs(),
            s3: default_s3(),
            timeouts: RawTimeoutConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawGatewayConfig {
    #[serde(default = "default_gateway_port")]
    port: u16,
    #[serde(default = "default_metrics_port")]
    metrics_port: u16,
}

fn default_gateway_port() -> u16 {
    8080
}

fn default_metrics_port() -> u16 {
    9200
}

impl Default for RawGatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            metrics_port: default_metrics_port(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawLambdaConfig {
    #[serde(default = "default_lambda_port")]
    port_base: u16,
    #[serde(default = "default_port_count")]
    port_count: u16,
    #[serde(default = "default_runtime_image_prefix")]
    runtime_image_prefix: String,
    #[serde(default = "default_runtimes")]
    runtimes: Vec<String>,
}

fn default_lambda_port() -> u16 {
    9002
}

fn default_port_count() -> u16 {
    100
}

fn default_runtime_image_prefix() -> String {
    "mlupin/docker-lambda".to_string()
}

fn default_runtimes() -> Vec<String> {
    ["python3.6", "python3.7", "python3.8", "python3.9", "nodejs14.x"]
        .iter()
        .map(|r| r.to_string())
        .collect()
}

impl Default for RawLambdaConfig {
    fn default() -> Self {
        Self {
            port_base: default_lambda_port(),
            port_count: default_port_count(),
            runtime_image_prefix: default_runtime_image_prefix(),
            runtimes: default_runtimes(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawServiceConfig {
    #[serde(default = "default_host")]
    host: String,
    port: u16,
    image: String,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_moto() -> RawServiceConfig {
    RawServiceConfig {
        host: default_host(),
        port: 9326,
        image: "motoserver/moto:3.0.4".to_string(),
    }
}

fn default_sqs() -> RawServiceConfig {
    RawServiceConfig {
        host: default_host(),
        port: 9324,
        image: "softwaremill/elasticmq-native:1.5.7".to_string(),
    }
}

fn default_s3() -> RawServiceConfig {
    RawServiceConfig {
        host: default_host(),
        port: 9000,
        image: "bitnami/minio:2022.2.16".to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct RawTimeoutConfig {
    #[serde(default = "default_stop_grace_secs")]
    stop_grace_secs: u64,
    #[serde(default = "default_upstream_secs")]
    upstream_secs: u64,
    #[serde(default = "default_poll_wait_secs")]
    poll_wait_secs: u64,
    #[serde(default = "default_readiness_secs")]
    readiness_secs: u64,
}

fn default_stop_grace_secs() -> u64 {
    30
}

fn default_upstream_secs() -> u64 {
    30
}

fn default_poll_wait_secs() -> u64 {
    5
}

fn default_readiness_secs() -> u64 {
    60
}

impl Default for RawTimeoutConfig {
    fn default() -> Self {
        Self {
            stop_grace_secs: default_stop_grace_secs(),
            upstream_secs: default_upstream_secs(),
            poll_wait_secs: default_poll_wait_secs(),
            readiness_secs: default_readiness_secs(),
        }
    }
}

/// Address and image of one backing emulator.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: Port,
    pub image: String,
}

impl ServiceConfig {
    /// Base URL of the service as seen from the host.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Function runtime settings.
#[derive(Debug, Clone)]
pub struct LambdaConfig {
    pub port_base: Port,
    pub port_count: u16,
    pub runtime_image_prefix: String,
    pub runtimes: Vec<Runtime>,
}

impl LambdaConfig {
    /// Inclusive range of host ports reserved for function containers.
    pub fn port_range(&self) -> (u16, u16) {
        let first = self.port_base.value();
        (first, first + (self.port_count - 1))
    }
}

/// Bounded waits applied to container and HTTP operations.
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub stop_grace: Duration,
    pub upstream: Duration,
    pub poll_wait: Duration,
    pub readiness: Duration,
}

impl Timeouts {
    /// Request timeout for function invocations: never shorter than the
    /// longest timeout a function may be configured with.
    pub fn invocation(&self) -> Duration {
        self.upstream
            .max(Duration::from_secs(u64::from(MAX_TIMEOUT_SECS)))
    }
}

/// Complete validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub account_number: String,
    pub region: String,
    pub data_path: PathBuf,
    pub gateway_port: Port,
    pub metrics_port: Port,
    pub lambda: LambdaConfig,
    pub moto: ServiceConfig,
    pub sqs: ServiceConfig,
    pub s3: ServiceConfig,
    pub timeouts: Timeouts,
}

impl Config {
    /// `{region}:{account}` fragment used in generated ARNs.
    pub fn arn_fragment(&self) -> String {
        format!("{}:{}", self.region, self.account_number)
    }

    /// Path of the SQLite database file.
    pub fn database_path(&self) -> PathBuf {
        self.data_path.join("nimbus.db")
    }
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    pub fn load_file(path: impl AsRef<Path>) -> NimbusResult<Config> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(NimbusError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| NimbusError::io("reading config file", e))?;

        Self::load_string(&content)
    }

    /// Load the file if it exists, otherwise fall back to built-in defaults.
    pub fn load_file_or_default(path: impl AsRef<Path>) -> NimbusResult<Config> {
        let path = path.as_ref();
        if path.exists() {
            Self::load_file(path)
        } else {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            Self::load_string("{}")
        }
    }

    /// Load and validate configuration from a YAML string.
    pub fn load_string(content: &str) -> NimbusResult<Config> {
        let raw: RawConfig =
            serde_yaml::from_str(content).map_err(|e| NimbusError::ConfigParse {
                message: format!("YAML parse error: {}", e),
            })?;

        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> NimbusResult<Config> {
        if raw.account_number.len() != 12 || !raw.account_number.chars().all(|c| c.is_ascii_digit())
        {
            return Err(HardValidationError::InvalidFieldValue {
                field: "account_number",
                value: raw.account_number,
                reason: "Account number must be 12 digits".to_string(),
            }
            .into());
        }

        if raw.region.is_empty() {
            return Err(HardValidationError::MissingRequiredField {
                field: "region",
                context: "root".to_string(),
            }
            .into());
        }

        let data_path = Self::resolve_data_path(&raw.data_path)?;
        let lambda = Self::validate_lambda(raw.lambda)?;
        let moto = Self::validate_service("moto", raw.moto)?;
        let sqs = Self::validate_service("sqs", raw.sqs)?;
        let s3 = Self::validate_service("s3", raw.s3)?;
        let timeouts = Self::validate_timeouts(raw.timeouts)?;

        let gateway_port = Port::new(raw.gateway.port)?;
        let metrics_port = Port::new(raw.gateway.metrics_port)?;

        // Host ports must not collide with the function port range.
        let (first, last) = lambda.port_range();
        // s3 and sqs also publish a second port right after the main one.
        let fixed = [
            ("gateway.port", gateway_port.value()),
            ("gateway.metrics_port", metrics_port.value()),
            ("moto.port", moto.port.value()),
            ("sqs.port", sqs.port.value()),
            ("sqs.port + 1", sqs.port.value().saturating_add(1)),
            ("s3.port", s3.port.value()),
            ("s3.port + 1", s3.port.value().saturating_add(1)),
        ];
        for (field, port) in fixed {
            if (first..=last).contains(&port) {
                return Err(HardValidationError::InvalidPort {
                    port,
                    reason: format!(
                        "{} overlaps the function port range {}..={}",
                        field, first, last
                    ),
                }
                .into());
            }
        }

        Ok(Config {
            account_number: raw.account_number,
            region: raw.region,
            data_path,
            gateway_port,
            metrics_port,
            lambda,
            moto,
            sqs,
            s3,
            timeouts,
        })
    }

    fn resolve_data_path(raw: &str) -> NimbusResult<PathBuf> {
        if raw.is_empty() {
            return Err(HardValidationError::MissingRequiredField {
                field: "data_path",
                context: "root".to_string(),
            }
            .into());
        }

        let path = PathBuf::from(raw);
        if path.is_absolute() {
            return Ok(path);
        }

        let cwd = std::env::current_dir()
            .map_err(|e| NimbusError::io("resolving working directory", e))?;
        Ok(cwd.join(path))
    }

    fn validate_lambda(raw: RawLambdaConfig) -> NimbusResult<LambdaConfig> {
        let port_base = Port::new(raw.port_base)?;

        if raw.port_count == 0 || u32::from(raw.port_base) + u32::from(raw.port_count) - 1 > 65535 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "lambda.port_count",
                value: raw.port_count.to_string(),
                reason: "Port range must be non-empty and end at or below 65535".to_string(),
            }
            .into());
        }

        if raw.runtime_image_prefix.is_empty() {
            return Err(HardValidationError::MissingRequiredField {
                field: "runtime_image_prefix",
                context: "lambda".to_string(),
            }
            .into());
        }

        let runtimes = raw
            .runtimes
            .into_iter()
            .map(Runtime::new)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(LambdaConfig {
            port_base,
            port_count: raw.port_count,
            runtime_image_prefix: raw.runtime_image_prefix,
            runtimes,
        })
    }

    fn validate_service(name: &'static str, raw: RawServiceConfig) -> NimbusResult<ServiceConfig> {
        if raw.image.is_empty() {
            return Err(HardValidationError::MissingRequiredField {
                field: "image",
                context: name.to_string(),
            }
            .into());
        }

        Ok(ServiceConfig {
            host: raw.host,
            port: Port::new(raw.port)?,
            image: raw.image,
        })
    }

    fn validate_timeouts(raw: RawTimeoutConfig) -> NimbusResult<Timeouts> {
        let checks = [
            ("timeouts.stop_grace_secs", raw.stop_grace_secs),
            ("timeouts.upstream_secs", raw.upstream_secs),
            ("timeouts.poll_wait_secs", raw.poll_wait_secs),
            ("timeouts.readiness_secs", raw.readiness_secs),
        ];
        for (field, value) in checks {
            if value == 0 {
                return Err(HardValidationError::InvalidFieldValue {
                    field,
                    value: "0".to_string(),
                    reason: "Timeout must be greater than 0".to_string(),
                }
                .into());
            }
        }

        // The queue emulator rejects long-poll waits above 20 seconds.
        if raw.poll_wait_secs > 20 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "timeouts.poll_wait_secs",
                value: raw.poll_wait_secs.to_string(),
                reason: "Long-poll wait must not exceed 20 seconds".to_string(),
            }
            .into());
        }

        Ok(Timeouts {
            stop_grace: Duration::from_secs(raw.stop_grace_secs),
            upstream: Duration::from_secs(raw.upstream_secs),
            poll_wait: Duration::from_secs(raw.poll_wait_secs),
            readiness: Duration::from_secs(raw.readiness_secs),
        })
    }
}
