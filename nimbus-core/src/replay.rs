// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Capture and replay of state-changing calls to the generic emulator.
//!
//! The generic emulator keeps identities and parameters in memory only, so
//! every mutating call proxied to it is appended to the durable store. On
//! startup the log is replayed in sequence order against the fresh emulator
//! before any other traffic is served.

use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method};

use crate::db::{ConnectionExt, Database, Migration};
use crate::error::{NimbusError, NimbusResult, ReplayError};

/// Routing header carrying `{Prefix}.{Operation}` for JSON protocols.
pub const AMZ_TARGET: &str = "x-amz-target";

/// Schema for the replay log.
pub const MIGRATIONS: &[Migration] = &[Migration {
    service: "Moto",
    description: "Create Requests Table",
    sql: "CREATE TABLE IF NOT EXISTS moto_request (
            id             integer primary key autoincrement,
            service        text not null,
            method         text not null,
            path           text not null,
            authorization  text not null,
            content_type   text not null,
            target         text,
            payload        blob not null
        );",
}];

/// Operations of each recorded service that never change state.
const READ_ONLY: &[(&str, &[&str])] = &[
    (
        "iam",
        &[
            "GetRole",
            "GetRolePolicy",
            "GetPolicy",
            "GetPolicyVersion",
            "GetUser",
            "ListRoles",
            "ListRolePolicies",
            "ListAttachedRolePolicies",
            "ListPolicies",
            "ListUsers",
        ],
    ),
    (
        "ssm",
        &[
            "GetParameter",
            "GetParameters",
            "GetParametersByPath",
            "GetParameterHistory",
            "DescribeParameters",
            "ListTagsForResource",
        ],
    ),
];

/// Services whose calls are captured.
pub fn is_recorded_service(service: &str) -> bool {
    READ_ONLY.iter().any(|(name, _)| *name == service)
}

/// Identify the operation of a proxied call.
///
/// JSON-protocol services name it in the `X-Amz-Target` header; query-protocol
/// services in the `Action` parameter of the form body or query string.
pub fn operation(path: &str, headers: &HeaderMap, payload: &[u8]) -> Option<String> {
    if let Some(target) = headers.get(AMZ_TARGET).and_then(|v| v.to_str().ok()) {
        return target.rsplit('.').next().map(str::to_string);
    }

    action(payload).or_else(|| {
        path.split_once('?')
            .and_then(|(_, query)| action(query.as_bytes()))
    })
}

fn action(form: &[u8]) -> Option<String> {
    url::form_urlencoded::parse(form)
        .find(|(key, _)| key == "Action")
        .map(|(_, value)| value.into_owned())
}

/// Whether a call to `service` should be appended to the replay log.
///
/// Only calls to recorded services are kept, minus the operations listed as
/// read-only. Calls whose operation cannot be identified are kept.
pub fn should_persist(service: &str, path: &str, headers: &HeaderMap, payload: &[u8]) -> bool {
    let Some((_, reads)) = READ_ONLY.iter().find(|(name, _)| *name == service) else {
        return false;
    };
    match operation(path, headers, payload) {
        Some(op) => !reads.contains(&op.as_str()),
        None => true,
    }
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub id: i64,
    pub service: String,
    pub method: String,
    pub path: String,
    pub authorization: String,
    pub content_type: String,
    pub target: Option<String>,
    pub payload: Vec<u8>,
}

impl ApiRequest {
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let pairs = [
            (AUTHORIZATION.as_str(), Some(self.authorization.as_str())),
            (CONTENT_TYPE.as_str(), Some(self.content_type.as_str())),
            (AMZ_TARGET, self.target.as_deref()),
        ];
        for (name, value) in pairs {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                if let (Ok(name), Ok(value)) = (
                    reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                    reqwest::header::HeaderValue::from_str(value),
                ) {
                    headers.insert(name, value);
                }
            }
        }
        headers
    }
}

fn header(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Headers forwarded to the emulator, both live and on replay.
fn forwarded_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::new();
    for name in [AUTHORIZATION.as_str(), CONTENT_TYPE.as_str(), AMZ_TARGET] {
        if let Some(value) = headers.get(name) {
            if let Ok(name) = reqwest::header::HeaderName::from_bytes(name.as_bytes()) {
                forwarded.insert(name, value.clone());
            }
        }
    }
    forwarded
}

/// Forward a call to an emulator at `endpoint` and return its response
/// unread.
pub async fn forward(
    client: &Client,
    endpoint: &str,
    method: Method,
    path: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> NimbusResult<reqwest::Response> {
    let url = format!("{endpoint}{path}");
    client
        .request(method, &url)
        .headers(forwarded_headers(headers))
        .body(body)
        .send()
        .await
        .map_err(|source| NimbusError::Upstream { target: url, source })
}

/// Append-only log of mutating calls plus the proxy that feeds it.
#[derive(Debug, Clone)]
pub struct ReplayLog {
    db: Arc<Database>,
    client: Client,
    endpoint: String,
}

impl ReplayLog {
    /// `endpoint` is the generic emulator's base URL.
    pub fn new(db: Arc<Database>, client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            db,
            client,
            endpoint: endpoint.into(),
        }
    }

    /// Append one call. Returns its sequence id.
    pub fn record(
        &self,
        service: &str,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        payload: &[u8],
    ) -> NimbusResult<i64> {
        let authorization = header(headers, AUTHORIZATION.as_str());
        let content_type = header(headers, CONTENT_TYPE.as_str());
        let target = headers
            .get(AMZ_TARGET)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let id = self.db.transaction("record request", |tx| {
            Ok(tx.insert_one(
                "insert request",
                "INSERT INTO moto_request (service, method, path, authorization, content_type, target, payload)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    service,
                    method.as_str(),
                    path,
                    authorization,
                    content_type,
                    target,
                    payload,
                ],
            )?)
        })?;

        tracing::info!(service = %service, id = id, "Recorded request");
        Ok(id)
    }

    /// Every recorded call in sequence order.
    pub fn requests(&self) -> NimbusResult<Vec<ApiRequest>> {
        self.db.read(|conn| {
            Ok(conn.query_all(
                "recorded requests",
                "SELECT id, service, method, path, authorization, content_type, target, payload
                    FROM moto_request ORDER BY id",
                [],
                |row| {
                    Ok(ApiRequest {
                        id: row.get(0)?,
                        service: row.get(1)?,
                        method: row.get(2)?,
                        path: row.get(3)?,
                        authorization: row.get(4)?,
                        content_type: row.get(5)?,
                        target: row.get(6)?,
                        payload: row.get(7)?,
                    })
                },
            )?)
        })
    }

    /// Proxy a live call to the emulator, recording it when the emulator
    /// accepted it and the operation changes state.
    pub async fn proxy(
        &self,
        service: &str,
        method: Method,
        path: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> NimbusResult<reqwest::Response> {
        let response = forward(&self.client, &self.endpoint, method.clone(), path, headers, body.clone()).await?;

        if response.status().is_success() && should_persist(service, path, headers, &body) {
            self.record(service, &method, path, headers, &body)?;
        } else {
            tracing::debug!(
                service = %service,
                status = %response.status(),
                "Request not recorded"
            );
        }
        Ok(response)
    }

    /// Re-issue every recorded call against the emulator, strictly in
    /// order. Stops at the first failure. Returns the number replayed.
    pub async fn replay_all(&self) -> NimbusResult<usize> {
        let requests = self.requests()?;
        tracing::info!(count = requests.len(), "Replaying recorded requests");

        for request in &requests {
            let method = Method::from_bytes(request.method.as_bytes()).map_err(|e| ReplayError::Request {
                id: request.id,
                service: request.service.clone(),
                reason: e.to_string(),
            })?;
            let url = format!("{}{}", self.endpoint, request.path);

            let response = self
                .client
                .request(method, &url)
                .headers(request.headers())
                .body(request.payload.clone())
                .send()
                .await
                .map_err(|e| ReplayError::Request {
                    id: request.id,
                    service: request.service.clone(),
                    reason: e.to_string(),
                })?;

            let status = response.status();
            if !status.is_success() {
                tracing::error!(id = request.id, service = %request.service, status = %status, "Replay rejected");
                return Err(ReplayError::Rejected {
                    id: request.id,
                    service: request.service.clone(),
                    status: status.as_u16(),
                }
                .into());
            }
            tracing::debug!(id = request.id, service = %request.service, "Replayed request");
        }

        tracing::info!(count = requests.len(), "Replay complete");
        Ok(requests.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use axum::http::StatusCode;
    use axum::routing::any;

    fn form_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, "application/x-www-form-urlencoded".parse().unwrap());
        headers.insert(AUTHORIZATION, "AWS4-HMAC-SHA256 Credential=AKID/20220101/us-west-2/iam/aws4_request".parse().unwrap());
        headers
    }

    fn target_headers(target: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AMZ_TARGET, target.parse().unwrap());
        headers
    }

    fn log(endpoint: &str) -> ReplayLog {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.migrate(MIGRATIONS).unwrap();
        ReplayLog::new(db, Client::new(), endpoint)
    }

    /// Emulator stand-in that records bodies and rejects `Action=Fail`.
    async fn emulator(seen: Arc<Mutex<Vec<String>>>) -> String {
        let app = axum::Router::new().route(
            "/",
            any(move |body: Bytes| {
                let seen = seen.clone();
                async move {
                    let body = String::from_utf8_lossy(&body).to_string();
                    seen.lock().unwrap().push(body.clone());
                    if body.contains("Action=Fail") {
                        StatusCode::BAD_REQUEST
                    } else {
                        StatusCode::OK
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    #[test]
    fn test_operation_from_form_and_target() {
        let headers = form_headers();
        assert_eq!(
            operation("/", &headers, b"Action=CreateRole&RoleName=r").as_deref(),
            Some("CreateRole")
        );
        assert_eq!(
            operation("/?Action=GetRole&RoleName=r", &headers, b"").as_deref(),
            Some("GetRole")
        );
        assert_eq!(
            operation("/", &target_headers("AmazonSSM.PutParameter"), b"{}").as_deref(),
            Some("PutParameter")
        );
        assert_eq!(operation("/", &HeaderMap::new(), b"{}"), None);
    }

    #[test]
    fn test_should_persist_uses_operation_not_substrings() {
        let headers = form_headers();
        assert!(should_persist("iam", "/", &headers, b"Action=CreateRole&RoleName=GetRole"));
        assert!(!should_persist("iam", "/", &headers, b"Action=GetRole&RoleName=x"));
        assert!(!should_persist("ssm", "/", &target_headers("AmazonSSM.GetParameter"), b"{}"));
        assert!(should_persist("ssm", "/", &target_headers("AmazonSSM.PutParameter"), b"{}"));
        assert!(!should_persist("sqs", "/", &headers, b"Action=CreateQueue"));
    }

    #[test]
    fn test_records_are_sequential() {
        let log = log("http://unused");
        let headers = form_headers();
        let a = log.record("iam", &Method::POST, "/", &headers, b"Action=CreateRole").unwrap();
        let b = log.record("ssm", &Method::POST, "/", &target_headers("AmazonSSM.PutParameter"), b"{}").unwrap();
        assert!(b > a);

        let requests = log.requests().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].content_type, "application/x-www-form-urlencoded");
        assert_eq!(requests[1].target.as_deref(), Some("AmazonSSM.PutParameter"));
    }

    #[tokio::test]
    async fn test_proxy_skips_reads_and_failures() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = log(&emulator(seen.clone()).await);
        let headers = form_headers();

        for body in ["Action=CreateRole", "Action=GetRole", "Action=Fail"] {
            log.proxy("iam", Method::POST, "/", &headers, Bytes::from(body)).await.unwrap();
        }

        assert_eq!(seen.lock().unwrap().len(), 3);
        let recorded: Vec<Vec<u8>> = log.requests().unwrap().into_iter().map(|r| r.payload).collect();
        assert_eq!(recorded, vec![b"Action=CreateRole".to_vec()]);
    }

    #[tokio::test]
    async fn test_replay_in_order_and_fail_fast() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = log(&emulator(seen.clone()).await);
        let headers = form_headers();
        for body in ["Action=One", "Action=Fail", "Action=Three"] {
            log.record("iam", &Method::POST, "/", &headers, body.as_bytes()).unwrap();
        }

        let err = log.replay_all().await.unwrap_err();
        assert!(matches!(err, NimbusError::Replay(ReplayError::Rejected { id: 2, status: 400, .. })));
        assert_eq!(*seen.lock().unwrap(), vec!["Action=One", "Action=Fail"]);
    }
}
