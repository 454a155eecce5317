// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Newtype wrappers for validated inputs.
//!
//! All types validate their invariants at creation time so that the store,
//! the router and the orchestrator never see a malformed name or limit.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::HardValidationError;

/// Smallest memory size accepted for a function, in megabytes.
pub const MIN_MEMORY_MB: u32 = 128;
/// Largest memory size accepted for a function, in megabytes.
pub const MAX_MEMORY_MB: u32 = 10_240;
/// Longest timeout accepted for a function, in seconds.
pub const MAX_TIMEOUT_SECS: u32 = 900;

fn validate_name(field: &'static str, value: &str, max_len: usize) -> Result<(), HardValidationError> {
    if value.is_empty() {
        return Err(HardValidationError::InvalidFieldValue {
            field,
            value: value.to_string(),
            reason: "Name cannot be empty".to_string(),
        });
    }

    if value.len() > max_len {
        return Err(HardValidationError::InvalidFieldValue {
            field,
            value: value.to_string(),
            reason: format!("Name too long: {} chars (max {})", value.len(), max_len),
        });
    }

    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(HardValidationError::InvalidFieldValue {
            field,
            value: value.to_string(),
            reason: "Name must contain only alphanumeric characters, hyphens, and underscores"
                .to_string(),
        });
    }

    Ok(())
}

/// Validated function name.
/// Must be non-empty, alphanumeric with hyphens/underscores, max 64 chars.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FunctionName(String);

impl FunctionName {
    pub fn new(name: impl Into<String>) -> Result<Self, HardValidationError> {
        let name = name.into();
        validate_name("FunctionName", &name, 64)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Logical container name used for this function's container.
    pub fn container_name(&self) -> String {
        format!("lambda-{}", self.0)
    }
}

impl fmt::Display for FunctionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for FunctionName {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FunctionName> for String {
    fn from(name: FunctionName) -> Self {
        name.0
    }
}

/// Validated layer name. Same alphabet as function names, max 140 chars.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LayerName(String);

impl LayerName {
    pub fn new(name: impl Into<String>) -> Result<Self, HardValidationError> {
        let name = name.into();
        validate_name("LayerName", &name, 140)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LayerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for LayerName {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<LayerName> for String {
    fn from(name: LayerName) -> Self {
        name.0
    }
}

/// Reference from a function version to a specific layer version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerRef {
    pub name: LayerName,
    pub version: u32,
}

impl LayerRef {
    pub fn new(name: LayerName, version: u32) -> Self {
        Self { name, version }
    }

    /// Render as a layer version ARN.
    pub fn arn(&self, region: &str, account: &str) -> String {
        format!(
            "arn:aws:lambda:{}:{}:layer:{}:{}",
            region, account, self.name, self.version
        )
    }
}

impl FromStr for LayerRef {
    type Err = HardValidationError;

    /// Accepts either a full layer version ARN
    /// (`arn:aws:lambda:{region}:{account}:layer:{name}:{version}`) or the
    /// short `{name}:{version}` form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let (name, version) = match parts.as_slice() {
            ["arn", _, "lambda", _, _, "layer", name, version] => (*name, *version),
            [name, version] => (*name, *version),
            _ => {
                return Err(HardValidationError::InvalidFieldValue {
                    field: "Layers",
                    value: s.to_string(),
                    reason: "Expected a layer version ARN or name:version".to_string(),
                })
            }
        };

        let version = version
            .parse::<u32>()
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| HardValidationError::InvalidFieldValue {
                field: "Layers",
                value: s.to_string(),
                reason: "Layer version must be a positive integer".to_string(),
            })?;

        Ok(Self {
            name: LayerName::new(name)?,
            version,
        })
    }
}

impl fmt::Display for LayerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

/// Runtime identifier such as `python3.8`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Runtime(String);

impl Runtime {
    pub fn new(runtime: impl Into<String>) -> Result<Self, HardValidationError> {
        let runtime = runtime.into();
        if runtime.is_empty()
            || !runtime
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
        {
            return Err(HardValidationError::InvalidFieldValue {
                field: "Runtime",
                value: runtime,
                reason: "Runtime must be a non-empty identifier".to_string(),
            });
        }
        Ok(Self(runtime))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Runtime {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Runtime> for String {
    fn from(runtime: Runtime) -> Self {
        runtime.0
    }
}

/// Validated network port.
/// Must be in range 1-65535 (0 is reserved).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Port(u16);

impl Port {
    pub fn new(port: u16) -> Result<Self, HardValidationError> {
        if port == 0 {
            return Err(HardValidationError::InvalidPort {
                port,
                reason: "Port 0 is reserved and cannot be used".to_string(),
            });
        }
        Ok(Self(port))
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u16> for Port {
    type Error = HardValidationError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Port> for u16 {
    fn from(port: Port) -> Self {
        port.0
    }
}

/// Function memory size in megabytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct MemorySize(u32);

impl MemorySize {
    pub fn from_mb(mb: u32) -> Result<Self, HardValidationError> {
        if !(MIN_MEMORY_MB..=MAX_MEMORY_MB).contains(&mb) {
            return Err(HardValidationError::InvalidFieldValue {
                field: "MemorySize",
                value: mb.to_string(),
                reason: format!("Must be between {} and {} MB", MIN_MEMORY_MB, MAX_MEMORY_MB),
            });
        }
        Ok(Self(mb))
    }

    pub fn megabytes(&self) -> u32 {
        self.0
    }
}

impl Default for MemorySize {
    fn default() -> Self {
        Self(MIN_MEMORY_MB)
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}MB", self.0)
    }
}

impl TryFrom<u32> for MemorySize {
    type Error = HardValidationError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::from_mb(value)
    }
}

impl From<MemorySize> for u32 {
    fn from(size: MemorySize) -> Self {
        size.0
    }
}

/// Function timeout in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Timeout(u32);

impl Timeout {
    pub fn from_secs(secs: u32) -> Result<Self, HardValidationError> {
        if secs == 0 || secs > MAX_TIMEOUT_SECS {
            return Err(HardValidationError::InvalidFieldValue {
                field: "Timeout",
                value: secs.to_string(),
                reason: format!("Must be between 1 and {} seconds", MAX_TIMEOUT_SECS),
            });
        }
        Ok(Self(secs))
    }

    pub fn seconds(&self) -> u32 {
        self.0
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Self(3)
    }
}

impl TryFrom<u32> for Timeout {
    type Error = HardValidationError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::from_secs(value)
    }
}

impl From<Timeout> for u32 {
    fn from(timeout: Timeout) -> Self {
        timeout.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_name_valid() {
        assert!(FunctionName::new("hello").is_ok());
        assert!(FunctionName::new("process_order-2").is_ok());
    }

    #[test]
    fn test_function_name_invalid() {
        assert!(FunctionName::new("").is_err());
        assert!(FunctionName::new("a".repeat(65)).is_err());
        assert!(FunctionName::new("func name").is_err());
        assert!(FunctionName::new("func:1").is_err());
    }

    #[test]
    fn test_container_name() {
        let name = FunctionName::new("hello").unwrap();
        assert_eq!(name.container_name(), "lambda-hello");
    }

    #[test]
    fn test_layer_ref_from_arn() {
        let layer: LayerRef = "arn:aws:lambda:us-west-2:271828182845:layer:libA:3"
            .parse()
            .unwrap();
        assert_eq!(layer.name.as_str(), "libA");
        assert_eq!(layer.version, 3);
        assert_eq!(
            layer.arn("us-west-2", "271828182845"),
            "arn:aws:lambda:us-west-2:271828182845:layer:libA:3"
        );
    }

    #[test]
    fn test_layer_ref_short_form() {
        let layer: LayerRef = "libA:1".parse().unwrap();
        assert_eq!(layer.to_string(), "libA:1");
    }

    #[test]
    fn test_layer_ref_invalid() {
        assert!("libA".parse::<LayerRef>().is_err());
        assert!("libA:0".parse::<LayerRef>().is_err());
        assert!("libA:x".parse::<LayerRef>().is_err());
        assert!("arn:aws:s3:::bucket".parse::<LayerRef>().is_err());
    }

    #[test]
    fn test_port() {
        assert!(Port::new(9002).is_ok());
        assert!(Port::new(0).is_err());
    }

    #[test]
    fn test_memory_size_bounds() {
        assert!(MemorySize::from_mb(128).is_ok());
        assert!(MemorySize::from_mb(10_240).is_ok());
        assert!(MemorySize::from_mb(64).is_err());
        assert!(MemorySize::from_mb(20_000).is_err());
        assert_eq!(MemorySize::default().megabytes(), 128);
    }

    #[test]
    fn test_timeout_bounds() {
        assert!(Timeout::from_secs(0).is_err());
        assert!(Timeout::from_secs(901).is_err());
        assert_eq!(Timeout::default().seconds(), 3);
    }

    #[test]
    fn test_runtime() {
        assert!(Runtime::new("python3.8").is_ok());
        assert!(Runtime::new("nodejs14.x").is_ok());
        assert!(Runtime::new("").is_err());
        assert!(Runtime::new("py 3").is_err());
    }
}
