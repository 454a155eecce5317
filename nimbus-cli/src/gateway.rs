// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! HTTP Gateway for Nimbus.
//!
//! Serves the function API under the provider's REST paths and forwards
//! every other call to the backing emulator for the service named in the
//! request signature.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header::AUTHORIZATION, Request, Response, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use futures_util::TryStreamExt;
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use nimbus_core::{Emulator, Function, FunctionName, LayerName, NimbusError};

use crate::api::{
    self, ApiError, ApiResult, CreateEventSourceMappingRequest, CreateFunctionRequest, EventSourceMapping,
    FunctionConfiguration, GetFunctionResponse, LayerVersion, ListLayerVersionsResponse, ListVersionsResponse,
    PublishLayerRequest, UpdateConfigurationRequest,
};
use crate::metrics;

/// Largest accepted request body: the base64 form of a 50 MB deployment
/// package plus the surrounding JSON.
pub const MAX_REQUEST_BODY_BYTES: usize = 70 * 1024 * 1024;

/// Gateway state shared across threads
#[derive(Clone)]
struct GatewayState {
    emulator: Arc<Emulator>,
}

/// Build the gateway's routes.
pub fn router(emulator: Arc<Emulator>) -> Router {
    let state = GatewayState { emulator };

    Router::new()
        .route("/2015-03-31/functions", post(create_function))
        .route("/2015-03-31/functions/", post(create_function))
        .route("/2015-03-31/functions/{name}", get(get_function))
        .route("/2015-03-31/functions/{name}/versions", get(list_versions))
        .route("/2015-03-31/functions/{name}/configuration", put(update_configuration))
        .route("/2015-03-31/functions/{name}/invocations", post(invoke))
        .route(
            "/2018-10-31/layers/{name}/versions",
            post(publish_layer).get(list_layer_versions),
        )
        .route("/2018-10-31/layers/{name}/versions/{version}", get(get_layer_version))
        .route("/2015-03-31/event-source-mappings/", post(create_event_source_mapping))
        .route("/2015-03-31/event-source-mappings/{uuid}", get(get_event_source_mapping))
        .route("/2020-06-30/functions/{name}/code-signing-config", get(code_signing_config))
        .fallback(proxy_service)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_gateway(
    port: u16,
    emulator: Arc<Emulator>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(emulator);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(addr = %addr, "Gateway listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    Ok(())
}

/// Service name from a SigV4 `Authorization` header:
/// `Credential=AKID/{date}/{region}/{service}/aws4_request`.
pub fn credential_service(authorization: &str) -> Option<&str> {
    let credential = authorization
        .split([',', ' '])
        .find_map(|part| part.trim().strip_prefix("Credential="))?;
    let mut scope = credential.split('/');
    scope.nth(3).filter(|service| !service.is_empty())
}

/// Relay an upstream response, streaming its body. Repeated headers are
/// kept as they arrived.
fn relay(response: reqwest::Response) -> ApiResult<Response<Body>> {
    let mut builder = Response::builder().status(response.status());
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in response.headers() {
            headers.append(name, value.clone());
        }
    }

    let stream = response.bytes_stream().map_err(std::io::Error::other);
    builder
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::bad_request(format!("Invalid upstream response: {e}")))
}

#[derive(Debug, Default, Deserialize)]
struct QualifierQuery {
    #[serde(rename = "Qualifier")]
    qualifier: Option<String>,
}

/// Resolve `$LATEST`, an explicit version or nothing to a function version.
fn resolve(emulator: &Emulator, name: &FunctionName, qualifier: Option<&str>) -> ApiResult<Function> {
    let store = emulator.store();
    match qualifier {
        None | Some("$LATEST") => Ok(store.latest_by_name(name)?),
        Some(version) => {
            let version = version
                .parse::<u32>()
                .map_err(|_| ApiError::bad_request(format!("Invalid qualifier: {version}")))?;
            Ok(store.version(name, version)?)
        }
    }
}

async fn create_function(
    State(state): State<GatewayState>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let request: CreateFunctionRequest = api::parse_json(&body)?;
    let (new, code) = request.into_new_function()?;

    let function = state.emulator.deploy_function(new, Bytes::from(code)).await?;
    let config = FunctionConfiguration::new(&function, state.emulator.config());
    Ok((StatusCode::CREATED, Json(config)))
}

async fn get_function(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
    Query(query): Query<QualifierQuery>,
) -> ApiResult<Json<GetFunctionResponse>> {
    let name = api::function_name(&name)?;
    let function = resolve(&state.emulator, &name, query.qualifier.as_deref())?;
    Ok(Json(GetFunctionResponse::new(&function, state.emulator.config())))
}

async fn list_versions(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ListVersionsResponse>> {
    let name = api::function_name(&name)?;
    let versions = state.emulator.store().versions_by_name(&name)?;
    if versions.is_empty() {
        return Err(NimbusError::FunctionNotFound { name: name.to_string() }.into());
    }

    let config = state.emulator.config();
    Ok(Json(ListVersionsResponse {
        versions: versions.iter().map(|f| FunctionConfiguration::new(f, config)).collect(),
    }))
}

async fn update_configuration(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
    body: Bytes,
) -> ApiResult<Json<FunctionConfiguration>> {
    let name = api::function_name(&name)?;
    let request: UpdateConfigurationRequest = api::parse_json(&body)?;

    let function = match request.environment {
        Some(environment) => {
            let (function, diff) = state
                .emulator
                .update_environment(&name, &environment.variables)
                .await?;
            tracing::info!(
                function = %name,
                added = diff.added.len(),
                changed = diff.changed.len(),
                removed = diff.removed.len(),
                "Updated function configuration"
            );
            function
        }
        None => state.emulator.store().latest_by_name(&name)?,
    };
    Ok(Json(FunctionConfiguration::new(&function, state.emulator.config())))
}

async fn invoke(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
    req: Request<Body>,
) -> ApiResult<Response<Body>> {
    let name = api::function_name(&name)?;
    if !state.emulator.router().is_running(&name) {
        // Tell an unknown function apart from a stopped one.
        state.emulator.store().latest_by_name(&name)?;
    }

    let method = req.method().clone();
    let path = req
        .uri()
        .path_and_query()
        .map(|x| x.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let body = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|e| ApiError::bad_request(format!("Unreadable request body: {e}")))?;

    let label = [name.as_str()];
    metrics::INVOCATIONS.with_label_values(&label).inc();
    let start = Instant::now();

    match state.emulator.invoke(&name, method, &path, body).await {
        Ok(response) => {
            metrics::INVOCATION_DURATION
                .with_label_values(&label)
                .observe(start.elapsed().as_secs_f64());
            relay(response)
        }
        Err(e) => {
            metrics::INVOCATION_ERRORS.with_label_values(&label).inc();
            Err(e.into())
        }
    }
}

async fn publish_layer(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let name = LayerName::new(name).map_err(NimbusError::from)?;
    let request: PublishLayerRequest = api::parse_json(&body)?;
    let (description, runtimes, content) = request.into_parts()?;

    let layer = state
        .emulator
        .publish_layer(name, description, runtimes, Bytes::from(content))
        .await?;
    Ok((StatusCode::CREATED, Json(LayerVersion::new(&layer, state.emulator.config()))))
}

async fn list_layer_versions(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ListLayerVersionsResponse>> {
    let name = LayerName::new(name).map_err(NimbusError::from)?;
    let layers = state.emulator.store().layer_versions(&name)?;

    let config = state.emulator.config();
    Ok(Json(ListLayerVersionsResponse {
        layer_versions: layers.iter().map(|l| LayerVersion::new(l, config)).collect(),
    }))
}

async fn get_layer_version(
    State(state): State<GatewayState>,
    Path((name, version)): Path<(String, u32)>,
) -> ApiResult<Json<LayerVersion>> {
    let name = LayerName::new(name).map_err(NimbusError::from)?;
    let layer = state.emulator.store().layer_version(&name, version)?;
    Ok(Json(LayerVersion::new(&layer, state.emulator.config())))
}

async fn create_event_source_mapping(
    State(state): State<GatewayState>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let request: CreateEventSourceMappingRequest = api::parse_json(&body)?;
    let function = api::function_name(&request.function_name)?;

    let source = state
        .emulator
        .subscribe_event_source(&request.event_source_arn, &function, request.batch_size)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EventSourceMapping::new(&source, state.emulator.config())),
    ))
}

async fn get_event_source_mapping(
    State(state): State<GatewayState>,
    Path(uuid): Path<String>,
) -> ApiResult<Json<EventSourceMapping>> {
    let id = Uuid::parse_str(&uuid).map_err(|_| ApiError::bad_request(format!("Invalid UUID: {uuid}")))?;
    let source = state.emulator.event_source(&id)?;
    Ok(Json(EventSourceMapping::new(&source, state.emulator.config())))
}

async fn code_signing_config(Path(name): Path<String>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "FunctionName": name }))
}

async fn proxy_service(State(state): State<GatewayState>, req: Request<Body>) -> ApiResult<Response<Body>> {
    let service = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(credential_service)
        .map(str::to_string)
        .ok_or_else(|| ApiError::bad_request("Missing or unsigned Authorization header"))?;

    let method = req.method().clone();
    let path = req
        .uri()
        .path_and_query()
        .map(|x| x.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = req.headers().clone();
    let body = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|e| ApiError::bad_request(format!("Unreadable request body: {e}")))?;

    tracing::debug!(service = %service, method = %method, path = %path, "Proxying service call");
    let response = state
        .emulator
        .proxy(&service, method, &path, &headers, body)
        .await?;
    relay(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use base64::Engine;
    use futures_util::stream::{self, BoxStream, StreamExt};
    use tower::ServiceExt;

    use nimbus_core::error::{ContainerError, PollerError};
    use nimbus_core::poller::QueueMessage;
    use nimbus_core::{ConfigLoader, ContainerRuntime, ContainerSpec, Database, QueueClient, Runtime};

    /// Container engine that accepts everything and runs nothing.
    struct NoopRuntime;

    #[async_trait]
    impl ContainerRuntime for NoopRuntime {
        async fn ensure_image(&self, _image: &str) -> Result<(), ContainerError> {
            Ok(())
        }

        async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
            Ok(format!("id-{}", spec.name))
        }

        async fn stop(&self, _id: &str, _grace: Duration) -> Result<(), ContainerError> {
            Ok(())
        }

        async fn remove(&self, _id: &str) -> Result<(), ContainerError> {
            Ok(())
        }

        fn logs(&self, _id: &str) -> BoxStream<'static, Result<String, ContainerError>> {
            stream::empty().boxed()
        }
    }

    struct NoQueues;

    #[async_trait]
    impl QueueClient for NoQueues {
        async fn resolve_queue_url(&self, queue: &str) -> Result<String, PollerError> {
            Err(PollerError::QueueNotFound {
                queue: queue.to_string(),
            })
        }

        async fn receive(&self, _url: &str, _max: u32, _wait: Duration) -> Result<Vec<QueueMessage>, PollerError> {
            Ok(Vec::new())
        }

        async fn delete(&self, _url: &str, _receipt: &str) -> Result<(), PollerError> {
            Ok(())
        }
    }

    fn app(dir: &tempfile::TempDir) -> Router {
        let config = ConfigLoader::load_string(&format!("data_path: {}\n", dir.path().display())).unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let emulator = Emulator::new(config, db, Arc::new(NoopRuntime), Arc::new(NoQueues)).unwrap();
        emulator
            .store()
            .seed_runtimes(&[Runtime::new("python3.8").unwrap()])
            .unwrap();
        router(Arc::new(emulator))
    }

    fn zip_base64() -> String {
        use std::io::Write;
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer
            .start_file("app.py", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"def handler(e, c): return e").unwrap();
        let bytes = writer.finish().unwrap().into_inner();
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: String) -> (StatusCode, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
    }

    #[test]
    fn test_credential_service() {
        let header = "AWS4-HMAC-SHA256 Credential=AKID/20220101/us-west-2/iam/aws4_request, \
                      SignedHeaders=host;x-amz-date, Signature=abc";
        assert_eq!(credential_service(header), Some("iam"));
        assert_eq!(credential_service("Bearer token"), None);
        assert_eq!(credential_service("Credential=AKID/20220101"), None);
    }

    #[tokio::test]
    async fn test_create_and_get_function() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir);

        let body = format!(
            r#"{{"FunctionName": "hello", "Runtime": "python3.8", "Handler": "app.handler",
                "Code": {{"ZipFile": "{}"}}}}"#,
            zip_base64()
        );
        let (status, created) = call(&app, "POST", "/2015-03-31/functions", body.clone()).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["Version"], "1");
        assert_eq!(
            created["FunctionArn"],
            "arn:aws:lambda:us-west-2:271828182845:function:hello:1"
        );

        call(&app, "POST", "/2015-03-31/functions", body).await;

        let (status, latest) = call(&app, "GET", "/2015-03-31/functions/hello", String::new()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(latest["Configuration"]["Version"], "2");

        let (_, first) = call(&app, "GET", "/2015-03-31/functions/hello?Qualifier=1", String::new()).await;
        assert_eq!(first["Configuration"]["Version"], "1");

        let (_, versions) = call(&app, "GET", "/2015-03-31/functions/hello/versions", String::new()).await;
        assert_eq!(versions["Versions"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_large_deployment_package_is_accepted() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir);

        // Stored without compression so the request body really is large.
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer
            .start_file(
                "app.py",
                zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored),
            )
            .unwrap();
        writer.write_all(b"def handler(e, c): return e\n").unwrap();
        writer.write_all(&vec![b'#'; 3 * 1024 * 1024]).unwrap();
        let package = writer.finish().unwrap().into_inner();

        let body = format!(
            r#"{{"FunctionName": "big", "Runtime": "python3.8", "Handler": "app.handler",
                "Code": {{"ZipFile": "{}"}}}}"#,
            base64::engine::general_purpose::STANDARD.encode(&package)
        );
        assert!(body.len() > 4 * 1024 * 1024);

        let (status, created) = call(&app, "POST", "/2015-03-31/functions", body).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["CodeSize"], package.len());
    }

    #[tokio::test]
    async fn test_relay_keeps_repeated_headers() {
        let upstream = axum::http::Response::builder()
            .status(StatusCode::OK)
            .header("set-cookie", "session=a")
            .header("set-cookie", "region=us-west-2")
            .body("done")
            .unwrap();

        let relayed = relay(reqwest::Response::from(upstream)).unwrap();
        let cookies: Vec<_> = relayed.headers().get_all("set-cookie").iter().collect();
        assert_eq!(cookies, vec!["session=a", "region=us-west-2"]);

        let body = axum::body::to_bytes(relayed.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"done");
    }

    #[tokio::test]
    async fn test_unknown_function_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir);

        let (status, body) = call(&app, "GET", "/2015-03-31/functions/ghost", String::new()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["Type"], "ResourceNotFoundException");

        let (status, _) = call(&app, "POST", "/2015-03-31/functions/ghost/invocations", "{}".into()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_publish_and_get_layer() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir);

        let body = format!(
            r#"{{"Description": "helpers", "CompatibleRuntimes": ["python3.8"],
                "Content": {{"ZipFile": "{}"}}}}"#,
            zip_base64()
        );
        let (status, layer) = call(&app, "POST", "/2018-10-31/layers/libA/versions", body).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(layer["Version"], 1);
        assert_eq!(
            layer["LayerVersionArn"],
            "arn:aws:lambda:us-west-2:271828182845:layer:libA:1"
        );

        let (status, fetched) = call(&app, "GET", "/2018-10-31/layers/libA/versions/1", String::new()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["Description"], "helpers");

        let (status, _) = call(&app, "GET", "/2018-10-31/layers/libA/versions/2", String::new()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unsigned_proxy_call_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir);

        let (status, _) = call(&app, "POST", "/", "Action=ListRoles".into()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
