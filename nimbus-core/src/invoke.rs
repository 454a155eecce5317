// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Invocation router: function name to running container port.
//!
//! Entries are maintained by whoever starts or stops a function container.
//! Lookups copy the port out of the map so an invoke never holds a shard
//! lock across network I/O.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use reqwest::{Client, Method};

use crate::error::{NimbusError, NimbusResult};
use crate::types::{FunctionName, Port};

/// Routes invocations to running function containers.
#[derive(Debug)]
pub struct InvocationRouter {
    routes: DashMap<FunctionName, Port>,
    client: Client,
    host: String,
}

impl InvocationRouter {
    /// Create a router reaching containers on `localhost`.
    ///
    /// `client` should carry the upstream timeout.
    pub fn new(client: Client) -> Self {
        Self::with_host(client, "localhost")
    }

    pub fn with_host(client: Client, host: impl Into<String>) -> Self {
        Self {
            routes: DashMap::new(),
            client,
            host: host.into(),
        }
    }

    pub fn new_shared(client: Client) -> Arc<Self> {
        Arc::new(Self::new(client))
    }

    /// Record that `name` is served on `port`. Returns the previous port.
    pub fn register_running(&self, name: FunctionName, port: Port) -> Option<Port> {
        tracing::debug!(function = %name, port = %port, "Registered function route");
        self.routes.insert(name, port)
    }

    /// Forget the route for `name`. Returns the port it used.
    pub fn unregister(&self, name: &FunctionName) -> Option<Port> {
        self.routes.remove(name).map(|(_, port)| port)
    }

    pub fn port_of(&self, name: &FunctionName) -> Option<Port> {
        self.routes.get(name).map(|entry| *entry.value())
    }

    pub fn is_running(&self, name: &FunctionName) -> bool {
        self.routes.contains_key(name)
    }

    /// Names with a registered route, sorted.
    pub fn running(&self) -> Vec<FunctionName> {
        let mut names: Vec<_> = self.routes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Forward a request to the container running `name`.
    ///
    /// The response is returned as-is so callers can stream its body.
    pub async fn invoke(
        &self,
        name: &FunctionName,
        method: Method,
        path: &str,
        body: impl Into<reqwest::Body>,
    ) -> NimbusResult<reqwest::Response> {
        let port = self.port_of(name).ok_or_else(|| NimbusError::FunctionNotRunning {
            name: name.to_string(),
        })?;

        let url = format!("http://{}:{}{}", self.host, port, path);
        tracing::debug!(function = %name, url = %url, method = %method, "Invoking function");

        self.client
            .request(method, &url)
            .body(body)
            .send()
            .await
            .map_err(|source| NimbusError::Upstream { target: url, source })
    }
}

/// Delivers event payloads to functions.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Invoke `name` with `payload`, returning the response body on a 2xx
    /// status.
    async fn invoke_event(&self, name: &FunctionName, payload: Bytes) -> NimbusResult<Bytes>;
}

#[async_trait]
impl Invoker for InvocationRouter {
    async fn invoke_event(&self, name: &FunctionName, payload: Bytes) -> NimbusResult<Bytes> {
        let path = format!("/2015-03-31/functions/{name}/invocations");
        let response = self.invoke(name, Method::POST, &path, payload).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NimbusError::InvocationFailed {
                name: name.to_string(),
                status: status.as_u16(),
            });
        }

        response.bytes().await.map_err(|source| NimbusError::Upstream {
            target: path,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::any;

    async fn echo_server() -> Port {
        let app = axum::Router::new().route(
            "/{*path}",
            any(|method: axum::http::Method, uri: axum::http::Uri, body: Bytes| async move {
                let status = if uri.path().ends_with("/teapot") {
                    StatusCode::IM_A_TEAPOT
                } else {
                    StatusCode::OK
                };
                (
                    status,
                    [("x-echo-method", method.to_string())],
                    format!("{} {}", uri.path(), String::from_utf8_lossy(&body)),
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        Port::new(port).unwrap()
    }

    fn router() -> InvocationRouter {
        InvocationRouter::with_host(Client::new(), "127.0.0.1")
    }

    fn name(value: &str) -> FunctionName {
        FunctionName::new(value).unwrap()
    }

    #[tokio::test]
    async fn test_invoke_unregistered_is_not_found() {
        let router = router();
        let err = router
            .invoke(&name("hello"), Method::POST, "/x", "body")
            .await
            .unwrap_err();
        assert!(matches!(err, NimbusError::FunctionNotRunning { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_invoke_forwards_request_unchanged() {
        let router = router();
        router.register_running(name("hello"), echo_server().await);

        let response = router
            .invoke(&name("hello"), Method::PUT, "/2015-03-31/functions/hello/teapot", "ping")
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 418);
        assert_eq!(response.headers()["x-echo-method"], "PUT");
        assert_eq!(
            response.text().await.unwrap(),
            "/2015-03-31/functions/hello/teapot ping"
        );
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let router = router();
        let port = Port::new(9002).unwrap();
        assert!(router.register_running(name("a"), port).is_none());
        assert_eq!(router.port_of(&name("a")), Some(port));
        assert_eq!(router.running(), vec![name("a")]);

        assert_eq!(router.unregister(&name("a")), Some(port));
        assert!(!router.is_running(&name("a")));
        assert!(router.unregister(&name("a")).is_none());
    }

    #[tokio::test]
    async fn test_invoke_event_requires_success() {
        let router = router();
        router.register_running(name("hello"), echo_server().await);

        let body = router
            .invoke_event(&name("hello"), Bytes::from_static(b"{}"))
            .await
            .unwrap();
        assert_eq!(&body[..], b"/2015-03-31/functions/hello/invocations {}");
    }
}
