// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Persistent data model for functions, layers and event sources.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::PollerError;
use crate::types::{FunctionName, LayerName, LayerRef, MemorySize, Runtime, Timeout};

/// One immutable version of a deployed function.
///
/// Code-changing updates create a new version; configuration-only updates
/// (environment) mutate the latest version in place.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    /// Row id of this version.
    pub id: i64,
    pub name: FunctionName,
    /// Monotonically increasing per name, starting at 1.
    pub version: u32,
    pub description: String,
    pub handler: String,
    pub role: String,
    pub dead_letter_arn: Option<String>,
    pub memory_size: MemorySize,
    pub timeout: Timeout,
    pub runtime: Runtime,
    pub code_sha256: String,
    pub code_size: i64,
    pub last_modified: DateTime<Utc>,
    /// Ordered layer references.
    pub layers: Vec<LayerRef>,
    pub environment: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
}

impl Function {
    pub fn arn(&self, arn_fragment: &str) -> String {
        format!("arn:aws:lambda:{}:function:{}", arn_fragment, self.name)
    }

    pub fn version_arn(&self, arn_fragment: &str) -> String {
        format!("{}:{}", self.arn(arn_fragment), self.version)
    }

    /// Directory holding this version's unpacked code.
    pub fn content_path(&self, data_path: &Path) -> PathBuf {
        function_version_dir(data_path, &self.name, self.version).join("content")
    }

    /// Directory holding this version's unpacked layers.
    pub fn layers_path(&self, data_path: &Path) -> PathBuf {
        function_version_dir(data_path, &self.name, self.version).join("layers")
    }
}

pub(crate) fn function_version_dir(data_path: &Path, name: &FunctionName, version: u32) -> PathBuf {
    data_path
        .join("lambda")
        .join("functions")
        .join(name.as_str())
        .join(version.to_string())
}

/// Input for deploying a new function version.
#[derive(Debug, Clone)]
pub struct NewFunction {
    pub name: FunctionName,
    pub description: String,
    pub handler: String,
    pub role: String,
    pub dead_letter_arn: Option<String>,
    pub memory_size: MemorySize,
    pub timeout: Timeout,
    pub runtime: Runtime,
    pub layers: Vec<LayerRef>,
    pub environment: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
}

impl NewFunction {
    /// Minimal definition with defaults for everything optional.
    pub fn new(name: FunctionName, handler: impl Into<String>, runtime: Runtime) -> Self {
        Self {
            name,
            description: String::new(),
            handler: handler.into(),
            role: String::new(),
            dead_letter_arn: None,
            memory_size: MemorySize::default(),
            timeout: Timeout::default(),
            runtime,
            layers: Vec::new(),
            environment: BTreeMap::new(),
            tags: BTreeMap::new(),
        }
    }
}

/// One immutable version of a shared code layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LambdaLayer {
    pub id: i64,
    pub name: LayerName,
    pub version: u32,
    pub description: String,
    pub compatible_runtimes: Vec<Runtime>,
    pub code_sha256: String,
    pub code_size: i64,
    pub created_on: DateTime<Utc>,
}

impl LambdaLayer {
    pub fn layer_ref(&self) -> LayerRef {
        LayerRef::new(self.name.clone(), self.version)
    }

    pub fn arn(&self, arn_fragment: &str) -> String {
        format!("arn:aws:lambda:{}:layer:{}", arn_fragment, self.name)
    }

    pub fn version_arn(&self, arn_fragment: &str) -> String {
        format!("{}:{}", self.arn(arn_fragment), self.version)
    }

    pub fn supports(&self, runtime: &Runtime) -> bool {
        self.compatible_runtimes.contains(runtime)
    }

    /// Location of the stored archive for this version.
    pub fn archive_path(&self, data_path: &Path) -> PathBuf {
        layer_archive_path(data_path, &self.name, self.version)
    }
}

pub(crate) fn layer_archive_path(data_path: &Path, name: &LayerName, version: u32) -> PathBuf {
    data_path
        .join("lambda")
        .join("layers")
        .join(name.as_str())
        .join(version.to_string())
        .join("content.zip")
}

/// Subscription binding a queue to a function.
#[derive(Debug, Clone, PartialEq)]
pub struct EventSource {
    pub id: Uuid,
    /// Source queue ARN, `arn:aws:sqs:{region}:{account}:{queue}`.
    pub arn: String,
    pub function: FunctionName,
    pub batch_size: u32,
    pub enabled: bool,
    pub last_modified: DateTime<Utc>,
}

impl EventSource {
    /// Queue name: the sixth `:`-separated field of the source ARN.
    pub fn queue_name(&self) -> Result<&str, PollerError> {
        queue_name_from_arn(&self.arn)
    }
}

pub fn queue_name_from_arn(arn: &str) -> Result<&str, PollerError> {
    match arn.split(':').collect::<Vec<_>>().as_slice() {
        ["arn", _, "sqs", _, _, queue] if !queue.is_empty() => Ok(*queue),
        _ => Err(PollerError::InvalidArn {
            arn: arn.to_string(),
        }),
    }
}
