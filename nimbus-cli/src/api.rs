// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Wire types of the function API and the error response mapping.
//!
//! Field names follow the provider's REST JSON documents so stock SDKs and
//! CLIs can talk to the gateway.

use std::collections::BTreeMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use nimbus_core::{
    Config, ErrorKind, EventSource, Function, LambdaLayer, LayerRef, MemorySize, NewFunction,
    NimbusError, Runtime, Timeout,
};

/// Errors surfaced to API clients.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] NimbusError),

    #[error("{message}")]
    BadRequest { message: String },
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    fn status_and_type(&self) -> (StatusCode, &'static str) {
        let kind = match self {
            Self::Core(e) => e.kind(),
            Self::BadRequest { .. } => ErrorKind::Validation,
        };
        match kind {
            ErrorKind::NotFound => (StatusCode::NOT_FOUND, "ResourceNotFoundException"),
            ErrorKind::Conflict => (StatusCode::CONFLICT, "ResourceConflictException"),
            ErrorKind::ResourceExhausted => (StatusCode::SERVICE_UNAVAILABLE, "TooManyRequestsException"),
            ErrorKind::Validation => (StatusCode::BAD_REQUEST, "InvalidParameterValueException"),
            ErrorKind::Transient => (StatusCode::BAD_GATEWAY, "ServiceException"),
            ErrorKind::Fatal => (StatusCode::INTERNAL_SERVER_ERROR, "ServiceException"),
        }
    }
}

impl From<nimbus_core::HardValidationError> for ApiError {
    fn from(e: nimbus_core::HardValidationError) -> Self {
        Self::Core(e.into())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorBody {
    #[serde(rename = "Type")]
    error_type: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status_and_type();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = %status, "Request rejected");
        }

        let body = ErrorBody {
            error_type,
            message: self.to_string(),
        };
        (status, [("x-amzn-errortype", error_type)], Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Parse a JSON request body. SDKs do not always send a JSON content type.
pub fn parse_json<T: for<'de> Deserialize<'de>>(body: &[u8]) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("Invalid request body: {e}")))
}

fn decode_zip(field: &str, encoded: Option<&str>) -> ApiResult<Vec<u8>> {
    let encoded = encoded.ok_or_else(|| ApiError::bad_request(format!("{field}.ZipFile is required")))?;
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| ApiError::bad_request(format!("{field}.ZipFile is not valid base64: {e}")))
}

/// Timestamp format used in function and layer documents.
fn lambda_timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3f%z").to_string()
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Environment {
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CodeInput {
    pub zip_file: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeadLetterConfig {
    pub target_arn: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateFunctionRequest {
    pub function_name: String,
    pub runtime: String,
    #[serde(default)]
    pub role: String,
    pub handler: String,
    pub code: CodeInput,
    #[serde(default)]
    pub description: String,
    pub timeout: Option<u32>,
    pub memory_size: Option<u32>,
    pub environment: Option<Environment>,
    #[serde(default)]
    pub layers: Vec<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub dead_letter_config: Option<DeadLetterConfig>,
}

impl CreateFunctionRequest {
    /// Validate into a deploy request plus the decoded code archive.
    pub fn into_new_function(self) -> ApiResult<(NewFunction, Vec<u8>)> {
        let code = decode_zip("Code", self.code.zip_file.as_deref())?;

        let mut new = NewFunction::new(
            function_name(&self.function_name)?,
            self.handler,
            Runtime::new(self.runtime)?,
        );
        new.role = self.role;
        new.description = self.description;
        new.dead_letter_arn = self.dead_letter_config.and_then(|d| d.target_arn);
        if let Some(mb) = self.memory_size {
            new.memory_size = MemorySize::from_mb(mb)?;
        }
        if let Some(secs) = self.timeout {
            new.timeout = Timeout::from_secs(secs)?;
        }
        new.layers = self
            .layers
            .iter()
            .map(|arn| arn.parse::<LayerRef>())
            .collect::<Result<_, _>>()?;
        new.environment = self.environment.unwrap_or_default().variables;
        new.tags = self.tags;
        Ok((new, code))
    }
}

/// Accept a bare function name or a function ARN.
pub fn function_name(raw: &str) -> ApiResult<nimbus_core::FunctionName> {
    let name = match raw.split(':').collect::<Vec<_>>().as_slice() {
        ["arn", _, "lambda", _, _, "function", name, ..] => name.to_string(),
        _ => raw.to_string(),
    };
    Ok(nimbus_core::FunctionName::new(name)?)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LayerSummary {
    pub arn: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct FunctionConfiguration {
    pub function_name: String,
    pub function_arn: String,
    pub runtime: String,
    pub role: String,
    pub handler: String,
    pub code_size: i64,
    pub description: String,
    pub timeout: u32,
    pub memory_size: u32,
    pub last_modified: String,
    pub code_sha256: String,
    pub version: String,
    pub environment: Environment,
    pub layers: Vec<LayerSummary>,
    pub state: &'static str,
}

impl FunctionConfiguration {
    pub fn new(function: &Function, config: &Config) -> Self {
        let fragment = config.arn_fragment();
        Self {
            function_name: function.name.to_string(),
            function_arn: function.version_arn(&fragment),
            runtime: function.runtime.to_string(),
            role: function.role.clone(),
            handler: function.handler.clone(),
            code_size: function.code_size,
            description: function.description.clone(),
            timeout: function.timeout.seconds(),
            memory_size: function.memory_size.megabytes(),
            last_modified: lambda_timestamp(&function.last_modified),
            code_sha256: function.code_sha256.clone(),
            version: function.version.to_string(),
            environment: Environment {
                variables: function.environment.clone(),
            },
            layers: function
                .layers
                .iter()
                .map(|layer| LayerSummary {
                    arn: layer.arn(&config.region, &config.account_number),
                })
                .collect(),
            state: "Active",
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CodeLocation {
    pub repository_type: &'static str,
    pub location: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetFunctionResponse {
    pub configuration: FunctionConfiguration,
    pub code: CodeLocation,
    pub tags: BTreeMap<String, String>,
}

impl GetFunctionResponse {
    pub fn new(function: &Function, config: &Config) -> Self {
        Self {
            configuration: FunctionConfiguration::new(function, config),
            code: CodeLocation {
                repository_type: "S3",
                location: function.content_path(&config.data_path).display().to_string(),
            },
            tags: function.tags.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListVersionsResponse {
    pub versions: Vec<FunctionConfiguration>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateConfigurationRequest {
    pub environment: Option<Environment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PublishLayerRequest {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub compatible_runtimes: Vec<String>,
    pub content: CodeInput,
}

impl PublishLayerRequest {
    pub fn into_parts(self) -> ApiResult<(String, Vec<Runtime>, Vec<u8>)> {
        let content = decode_zip("Content", self.content.zip_file.as_deref())?;
        let runtimes = self
            .compatible_runtimes
            .into_iter()
            .map(Runtime::new)
            .collect::<Result<_, _>>()?;
        Ok((self.description, runtimes, content))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LayerContent {
    pub location: String,
    pub code_sha256: String,
    pub code_size: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LayerVersion {
    pub layer_arn: String,
    pub layer_version_arn: String,
    pub description: String,
    pub created_date: String,
    pub version: u32,
    pub compatible_runtimes: Vec<String>,
    pub content: LayerContent,
}

impl LayerVersion {
    pub fn new(layer: &LambdaLayer, config: &Config) -> Self {
        let fragment = config.arn_fragment();
        Self {
            layer_arn: layer.arn(&fragment),
            layer_version_arn: layer.version_arn(&fragment),
            description: layer.description.clone(),
            created_date: lambda_timestamp(&layer.created_on),
            version: layer.version,
            compatible_runtimes: layer.compatible_runtimes.iter().map(ToString::to_string).collect(),
            content: LayerContent {
                location: layer.archive_path(&config.data_path).display().to_string(),
                code_sha256: layer.code_sha256.clone(),
                code_size: layer.code_size,
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListLayerVersionsResponse {
    pub layer_versions: Vec<LayerVersion>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateEventSourceMappingRequest {
    pub event_source_arn: String,
    pub function_name: String,
    pub batch_size: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventSourceMapping {
    #[serde(rename = "UUID")]
    pub uuid: String,
    pub event_source_arn: String,
    pub function_arn: String,
    pub batch_size: u32,
    pub state: &'static str,
    /// Seconds since the epoch.
    pub last_modified: f64,
}

impl EventSourceMapping {
    pub fn new(source: &EventSource, config: &Config) -> Self {
        Self {
            uuid: source.id.to_string(),
            event_source_arn: source.arn.clone(),
            function_arn: format!(
                "arn:aws:lambda:{}:function:{}",
                config.arn_fragment(),
                source.function
            ),
            batch_size: source.batch_size,
            state: if source.enabled { "Enabled" } else { "Disabled" },
            last_modified: source.last_modified.timestamp_millis() as f64 / 1000.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(bytes: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    #[test]
    fn test_create_request_defaults() {
        let body = format!(
            r#"{{"FunctionName": "hello", "Runtime": "python3.8", "Handler": "app.handler",
                "Code": {{"ZipFile": "{}"}}}}"#,
            encoded(b"PK")
        );
        let request: CreateFunctionRequest = parse_json(body.as_bytes()).unwrap();
        let (new, code) = request.into_new_function().unwrap();

        assert_eq!(new.name.as_str(), "hello");
        assert_eq!(new.memory_size.megabytes(), 128);
        assert_eq!(new.timeout.seconds(), 3);
        assert!(new.layers.is_empty());
        assert_eq!(code, b"PK");
    }

    #[test]
    fn test_create_request_parses_layers_and_environment() {
        let body = format!(
            r#"{{"FunctionName": "arn:aws:lambda:us-west-2:271828182845:function:hello",
                "Runtime": "python3.8", "Handler": "app.handler", "MemorySize": 256,
                "Layers": ["arn:aws:lambda:us-west-2:271828182845:layer:libA:1"],
                "Environment": {{"Variables": {{"STAGE": "dev"}}}},
                "Code": {{"ZipFile": "{}"}}}}"#,
            encoded(b"PK")
        );
        let request: CreateFunctionRequest = parse_json(body.as_bytes()).unwrap();
        let (new, _) = request.into_new_function().unwrap();

        assert_eq!(new.name.as_str(), "hello");
        assert_eq!(new.memory_size.megabytes(), 256);
        assert_eq!(new.layers[0].to_string(), "libA:1");
        assert_eq!(new.environment["STAGE"], "dev");
    }

    #[test]
    fn test_create_request_rejects_bad_input() {
        let missing_code = r#"{"FunctionName": "hello", "Runtime": "python3.8", "Handler": "h", "Code": {}}"#;
        let request: CreateFunctionRequest = parse_json(missing_code.as_bytes()).unwrap();
        assert!(matches!(request.into_new_function(), Err(ApiError::BadRequest { .. })));

        let bad_memory = format!(
            r#"{{"FunctionName": "hello", "Runtime": "python3.8", "Handler": "h",
                "MemorySize": 1, "Code": {{"ZipFile": "{}"}}}}"#,
            encoded(b"PK")
        );
        let request: CreateFunctionRequest = parse_json(bad_memory.as_bytes()).unwrap();
        let err = request.into_new_function().unwrap_err();
        assert_eq!(err.status_and_type().0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (
                ApiError::from(NimbusError::FunctionNotFound { name: "x".into() }),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(NimbusError::PortPoolExhausted { first: 1, last: 2 }),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ApiError::from(NimbusError::InvocationFailed {
                    name: "x".into(),
                    status: 500,
                }),
                StatusCode::BAD_GATEWAY,
            ),
            (ApiError::bad_request("nope"), StatusCode::BAD_REQUEST),
        ];
        for (error, status) in cases {
            assert_eq!(error.status_and_type().0, status);
        }
    }
}
