// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Custom error types for Nimbus.
//!
//! Explicit enum error types throughout; no `Box<dyn Error>` and no
//! `anyhow::Result` in library code. Every error can be classified into an
//! [`ErrorKind`] so the gateway can map it onto an HTTP status.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for the emulator.
#[derive(Debug, Error)]
pub enum NimbusError {
    // =========================================================================
    // Configuration / Input Validation Errors
    // =========================================================================
    #[error("Hard validation error: {0}")]
    HardValidation(#[from] HardValidationError),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    // =========================================================================
    // Lookup Errors
    // =========================================================================
    #[error("Function not found: {name}")]
    FunctionNotFound { name: String },

    #[error("Function {name} is not running")]
    FunctionNotRunning { name: String },

    #[error("Layer not found: {name}:{version}")]
    LayerNotFound { name: String, version: String },

    #[error("Runtime not found: {runtime}")]
    RuntimeNotFound { runtime: String },

    #[error("Event source not found: {id}")]
    EventSourceNotFound { id: String },

    #[error("Service {service} is not emulated")]
    ServiceNotSupported { service: String },

    #[error("Layer {layer}:{version} is not compatible with runtime {runtime}")]
    IncompatibleLayer {
        layer: String,
        version: u32,
        runtime: String,
    },

    // =========================================================================
    // Resource Errors
    // =========================================================================
    #[error("Port pool exhausted: all ports in {first}..={last} are in use")]
    PortPoolExhausted { first: u16, last: u16 },

    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    #[error("Container {container} was not ready after {waited_secs}s")]
    ReadinessTimeout { container: String, waited_secs: u64 },

    #[error("{0}")]
    Shutdown(#[from] ShutdownError),

    // =========================================================================
    // Durable State Errors
    // =========================================================================
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Replay error: {0}")]
    Replay(#[from] ReplayError),

    #[error("Event source poller error: {0}")]
    Poller(#[from] PollerError),

    // =========================================================================
    // Transport / System Errors
    // =========================================================================
    #[error("Upstream request to {target} failed: {source}")]
    Upstream {
        target: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Invocation of {name} returned status {status}")]
    InvocationFailed { name: String, status: u16 },

    #[error("Archive error: {context} - {reason}")]
    Archive { context: String, reason: String },

    #[error("IO error: {context} - {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Coarse classification of errors used at the HTTP boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    ResourceExhausted,
    Validation,
    Transient,
    Fatal,
}

impl NimbusError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::HardValidation(_) | Self::ConfigParse { .. } | Self::IncompatibleLayer { .. } => {
                ErrorKind::Validation
            }
            Self::ConfigNotFound { .. }
            | Self::FunctionNotFound { .. }
            | Self::FunctionNotRunning { .. }
            | Self::LayerNotFound { .. }
            | Self::RuntimeNotFound { .. }
            | Self::EventSourceNotFound { .. }
            | Self::ServiceNotSupported { .. } => ErrorKind::NotFound,
            Self::PortPoolExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::Container(ContainerError::AlreadyRunning { .. }) => ErrorKind::Conflict,
            Self::Container(ContainerError::NotRunning { .. }) => ErrorKind::NotFound,
            Self::Poller(PollerError::QueueNotFound { .. }) => ErrorKind::NotFound,
            Self::Poller(PollerError::InvalidArn { .. }) => ErrorKind::Validation,
            Self::Upstream { .. } | Self::InvocationFailed { .. } | Self::Poller(_) => {
                ErrorKind::Transient
            }
            Self::Container(_)
            | Self::ReadinessTimeout { .. }
            | Self::Shutdown(_)
            | Self::Store(_)
            | Self::Replay(_)
            | Self::Archive { .. }
            | Self::Io { .. } => ErrorKind::Fatal,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Validation errors for configuration and API input.
#[derive(Debug, Error)]
pub enum HardValidationError {
    #[error("Missing required field: {field} in {context}")]
    MissingRequiredField {
        field: &'static str,
        context: String,
    },

    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid port: {port} - {reason}")]
    InvalidPort { port: u16, reason: String },
}

/// Container orchestration errors.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Container {name} is already running")]
    AlreadyRunning { name: String },

    #[error("Container {name} is not running")]
    NotRunning { name: String },

    #[error("Failed to pull image {image}: {reason}")]
    ImagePull { image: String, reason: String },

    #[error("Failed to create container {name}: {reason}")]
    Create { name: String, reason: String },

    #[error("Failed to start container {name}: {reason}")]
    Start { name: String, reason: String },

    #[error("Failed to stop container {name}: {reason}")]
    Stop { name: String, reason: String },

    #[error("Failed to remove container {name}: {reason}")]
    Remove { name: String, reason: String },

    #[error("Log stream for {name} failed: {reason}")]
    Logs { name: String, reason: String },

    #[error("Mount source {path} exists but is not a directory")]
    MountNotDirectory { path: PathBuf },

    #[error("Mount source {path} is not a regular file")]
    MountNotFile { path: PathBuf },

    #[error("Unable to create mount source {path}: {source}")]
    MountCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Query failed ({context}): {source}")]
    Query {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Migration '{description}' for {service} failed: {source}")]
    Migration {
        service: &'static str,
        description: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Unable to open database {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Stored row is malformed: {message}")]
    Malformed { message: String },
}

impl StoreError {
    pub(crate) fn query(context: impl Into<String>) -> impl FnOnce(rusqlite::Error) -> Self {
        let context = context.into();
        move |source| Self::Query { context, source }
    }
}

/// Errors while replaying recorded requests.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Replaying {service} request #{id} failed: {reason}")]
    Request {
        id: i64,
        service: String,
        reason: String,
    },

    #[error("Replaying {service} request #{id} was rejected with status {status}")]
    Rejected {
        id: i64,
        service: String,
        status: u16,
    },
}

/// Errors raised by event-source pollers and queue clients.
#[derive(Debug, Error)]
pub enum PollerError {
    #[error("Invalid queue ARN: {arn}")]
    InvalidArn { arn: String },

    #[error("Queue {queue} not found")]
    QueueNotFound { queue: String },

    #[error("Found {count} queues matching {queue}, expected exactly one")]
    AmbiguousQueue { queue: String, count: usize },

    #[error("Queue request {action} for {queue} failed: {reason}")]
    Request {
        action: &'static str,
        queue: String,
        reason: String,
    },
}

/// Aggregate of every failure seen while shutting down containers.
#[derive(Debug)]
pub struct ShutdownError {
    pub failures: Vec<(String, ContainerError)>,
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} container(s) failed to shut down: ", self.failures.len())?;
        for (i, (name, err)) in self.failures.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name} ({err})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ShutdownError {}

/// Result type alias using NimbusError.
pub type NimbusResult<T> = Result<T, NimbusError>;
