// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Event source pollers.
//!
//! One background loop per enabled event source long-polls its queue and
//! invokes the target function once per message, in receipt order. A message
//! is deleted only after a successful invocation, so failed deliveries become
//! visible again on the queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{NimbusResult, PollerError};
use crate::invoke::Invoker;
use crate::lambda::EventSource;

/// First delay after a failed poll.
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// A message received from a queue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    #[serde(default, rename = "MD5OfBody")]
    pub md5_of_body: String,
}

/// Minimal queue API needed by the pollers.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Resolve a queue name to its URL. Exactly one queue must match.
    async fn resolve_queue_url(&self, queue: &str) -> Result<String, PollerError>;

    /// Long-poll for up to `max` messages.
    async fn receive(&self, queue_url: &str, max: u32, wait: Duration) -> Result<Vec<QueueMessage>, PollerError>;

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<(), PollerError>;
}

/// [`QueueClient`] speaking the JSON protocol of the queue emulator.
#[derive(Debug, Clone)]
pub struct SqsClient {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ListQueuesRequest<'a> {
    queue_name_prefix: &'a str,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct ListQueuesResponse {
    #[serde(default)]
    queue_urls: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ReceiveMessageRequest<'a> {
    queue_url: &'a str,
    max_number_of_messages: u32,
    wait_time_seconds: u64,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct ReceiveMessageResponse {
    #[serde(default)]
    messages: Vec<QueueMessage>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DeleteMessageRequest<'a> {
    queue_url: &'a str,
    receipt_handle: &'a str,
}

impl SqsClient {
    /// `endpoint` is the emulator's base URL, e.g. `http://localhost:9324`.
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    async fn call<Req, Resp>(&self, action: &'static str, queue: &str, request: &Req) -> Result<Resp, PollerError>
    where
        Req: Serialize + Sync,
        Resp: for<'de> Deserialize<'de> + Default,
    {
        let to_err = |reason: String| PollerError::Request {
            action,
            queue: queue.to_string(),
            reason,
        };

        let response = self
            .client
            .post(format!("{}/", self.endpoint))
            .header("X-Amz-Target", format!("AmazonSQS.{action}"))
            .header("Content-Type", "application/x-amz-json-1.0")
            .json(request)
            .send()
            .await
            .map_err(|e| to_err(e.to_string()))?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| to_err(e.to_string()))?;
        if !status.is_success() {
            return Err(to_err(format!(
                "status {}: {}",
                status,
                String::from_utf8_lossy(&body)
            )));
        }

        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Resp::default());
        }
        serde_json::from_slice(&body).map_err(|e| to_err(format!("invalid response: {e}")))
    }
}

#[async_trait]
impl QueueClient for SqsClient {
    async fn resolve_queue_url(&self, queue: &str) -> Result<String, PollerError> {
        let response: ListQueuesResponse = self
            .call("ListQueues", queue, &ListQueuesRequest { queue_name_prefix: queue })
            .await?;

        // The prefix also matches e.g. `orders-dlq` for `orders`.
        let mut matches: Vec<String> = response
            .queue_urls
            .into_iter()
            .filter(|url| url.rsplit('/').next() == Some(queue))
            .collect();

        match matches.len() {
            0 => Err(PollerError::QueueNotFound {
                queue: queue.to_string(),
            }),
            1 => Ok(matches.remove(0)),
            count => Err(PollerError::AmbiguousQueue {
                queue: queue.to_string(),
                count,
            }),
        }
    }

    async fn receive(&self, queue_url: &str, max: u32, wait: Duration) -> Result<Vec<QueueMessage>, PollerError> {
        let request = ReceiveMessageRequest {
            queue_url,
            max_number_of_messages: max,
            wait_time_seconds: wait.as_secs(),
        };
        let response: ReceiveMessageResponse = self.call("ReceiveMessage", queue_url, &request).await?;
        Ok(response.messages)
    }

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<(), PollerError> {
        let request = DeleteMessageRequest {
            queue_url,
            receipt_handle,
        };
        let _: serde_json::Value = self.call("DeleteMessage", queue_url, &request).await?;
        Ok(())
    }
}

/// Build the invocation payload for one queue message.
pub fn sqs_event(message: &QueueMessage, source_arn: &str, region: &str) -> serde_json::Value {
    serde_json::json!({
        "Records": [{
            "messageId": message.message_id,
            "receiptHandle": message.receipt_handle,
            "body": message.body,
            "attributes": {},
            "messageAttributes": {},
            "md5OfBody": message.md5_of_body,
            "eventSource": "aws:sqs",
            "eventSourceARN": source_arn,
            "awsRegion": region,
        }]
    })
}

/// Exponential delay between failed polls, capped at the long-poll wait.
#[derive(Debug)]
struct Backoff {
    current: Duration,
    cap: Duration,
}

impl Backoff {
    fn new(cap: Duration) -> Self {
        Self {
            current: INITIAL_BACKOFF.min(cap),
            cap,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    fn reset(&mut self) {
        self.current = INITIAL_BACKOFF.min(self.cap);
    }
}

/// Delivery counters across all pollers.
#[derive(Debug, Default)]
pub struct PollerStats {
    pub delivered: AtomicU64,
    pub failed: AtomicU64,
}

struct PollerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Starts and stops one polling loop per event source.
pub struct EventSourcePoller {
    queue: Arc<dyn QueueClient>,
    invoker: Arc<dyn Invoker>,
    poll_wait: Duration,
    region: String,
    stats: Arc<PollerStats>,
    running: Mutex<HashMap<Uuid, PollerHandle>>,
}

impl std::fmt::Debug for EventSourcePoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSourcePoller")
            .field("poll_wait", &self.poll_wait)
            .field("region", &self.region)
            .field("running", &self.lock().len())
            .finish()
    }
}

impl EventSourcePoller {
    pub fn new(
        queue: Arc<dyn QueueClient>,
        invoker: Arc<dyn Invoker>,
        poll_wait: Duration,
        region: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            invoker,
            poll_wait,
            region: region.into(),
            stats: Arc::new(PollerStats::default()),
            running: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, PollerHandle>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn stats(&self) -> &PollerStats {
        &self.stats
    }

    /// Start polling for `source`. Disabled sources and sources that
    /// already have a loop are left alone.
    pub async fn start(&self, source: &EventSource) -> NimbusResult<()> {
        if !source.enabled {
            tracing::info!(event_source = %source.id, "Event source disabled, not polling");
            return Ok(());
        }
        if self.is_running(&source.id) {
            tracing::debug!(event_source = %source.id, "Poller already running");
            return Ok(());
        }

        let queue_name = source.queue_name()?;
        let queue_url = self.queue.resolve_queue_url(queue_name).await?;

        tracing::info!(
            event_source = %source.id,
            queue = %queue_name,
            function = %source.function,
            batch_size = source.batch_size,
            "Starting event source poller"
        );

        let token = CancellationToken::new();
        let task = tokio::spawn(
            PollLoop {
                queue: Arc::clone(&self.queue),
                invoker: Arc::clone(&self.invoker),
                stats: Arc::clone(&self.stats),
                source: source.clone(),
                queue_url,
                region: self.region.clone(),
                poll_wait: self.poll_wait,
                token: token.clone(),
            }
            .run(),
        );

        let mut running = self.lock();
        if let Some(previous) = running.insert(source.id, PollerHandle { token, task }) {
            // Lost a race with a concurrent start for the same source.
            previous.token.cancel();
        }
        Ok(())
    }

    /// Signal the loop for `id` to exit. Returns whether one was running.
    ///
    /// An in-flight poll is allowed to finish.
    pub fn stop(&self, id: &Uuid) -> bool {
        match self.lock().remove(id) {
            Some(handle) => {
                handle.token.cancel();
                tracing::info!(event_source = %id, "Stopping event source poller");
                true
            }
            None => false,
        }
    }

    /// Signal every loop to exit and wait for them to finish.
    pub async fn stop_all(&self) {
        let handles: Vec<(Uuid, PollerHandle)> = self.lock().drain().collect();
        for (_, handle) in &handles {
            handle.token.cancel();
        }
        for (id, handle) in handles {
            if let Err(e) = handle.task.await {
                tracing::warn!(event_source = %id, error = %e, "Poller task ended abnormally");
            }
        }
    }

    pub fn is_running(&self, id: &Uuid) -> bool {
        self.lock().contains_key(id)
    }

    pub fn running_count(&self) -> usize {
        self.lock().len()
    }
}

struct PollLoop {
    queue: Arc<dyn QueueClient>,
    invoker: Arc<dyn Invoker>,
    stats: Arc<PollerStats>,
    source: EventSource,
    queue_url: String,
    region: String,
    poll_wait: Duration,
    token: CancellationToken,
}

impl PollLoop {
    async fn run(self) {
        let mut backoff = Backoff::new(self.poll_wait);
        let max = self.source.batch_size.max(1);

        while !self.token.is_cancelled() {
            let messages = match self.queue.receive(&self.queue_url, max, self.poll_wait).await {
                Ok(messages) => {
                    backoff.reset();
                    messages
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        event_source = %self.source.id,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Poll failed"
                    );
                    tokio::select! {
                        _ = self.token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            if messages.is_empty() {
                tracing::trace!(event_source = %self.source.id, "No messages");
            }

            for message in messages {
                self.deliver(&message).await;
            }
        }

        tracing::info!(event_source = %self.source.id, "Event source poller stopped");
    }

    async fn deliver(&self, message: &QueueMessage) {
        let event = sqs_event(message, &self.source.arn, &self.region);
        let payload = Bytes::from(event.to_string());

        match self.invoker.invoke_event(&self.source.function, payload).await {
            Ok(_) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    event_source = %self.source.id,
                    function = %self.source.function,
                    message_id = %message.message_id,
                    "Delivered message"
                );
                if let Err(e) = self.queue.delete(&self.queue_url, &message.receipt_handle).await {
                    tracing::warn!(
                        event_source = %self.source.id,
                        message_id = %message.message_id,
                        error = %e,
                        "Unable to delete delivered message"
                    );
                }
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    event_source = %self.source.id,
                    function = %self.source.function,
                    message_id = %message.message_id,
                    error = %e,
                    "Invocation failed, message left on queue"
                );
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-process queue and invoker doubles.

    use std::collections::VecDeque;

    use super::*;
    use crate::error::NimbusError;
    use crate::types::FunctionName;

    #[derive(Debug, Default)]
    pub(crate) struct FakeQueue {
        pub queues: Mutex<HashMap<String, VecDeque<QueueMessage>>>,
        pub deleted: Mutex<Vec<String>>,
        pub fail_receives: AtomicU64,
    }

    impl FakeQueue {
        pub(crate) fn with_messages(queue: &str, bodies: &[&str]) -> Arc<Self> {
            let messages = bodies
                .iter()
                .enumerate()
                .map(|(i, body)| QueueMessage {
                    message_id: format!("m{i}"),
                    receipt_handle: format!("r{i}"),
                    body: body.to_string(),
                    md5_of_body: String::new(),
                })
                .collect();
            let fake = Self::default();
            fake.queues.lock().unwrap().insert(queue.to_string(), messages);
            Arc::new(fake)
        }
    }

    #[async_trait]
    impl QueueClient for FakeQueue {
        async fn resolve_queue_url(&self, queue: &str) -> Result<String, PollerError> {
            if self.queues.lock().unwrap().contains_key(queue) {
                Ok(format!("http://queue/{queue}"))
            } else {
                Err(PollerError::QueueNotFound {
                    queue: queue.to_string(),
                })
            }
        }

        async fn receive(&self, queue_url: &str, max: u32, _wait: Duration) -> Result<Vec<QueueMessage>, PollerError> {
            if self
                .fail_receives
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(PollerError::Request {
                    action: "ReceiveMessage",
                    queue: queue_url.to_string(),
                    reason: "injected".to_string(),
                });
            }

            let batch: Vec<QueueMessage> = {
                let name = queue_url.rsplit('/').next().unwrap_or_default();
                let mut queues = self.queues.lock().unwrap();
                let queue = queues.entry(name.to_string()).or_default();
                let take = (max as usize).min(queue.len());
                queue.drain(..take).collect()
            };
            if batch.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(batch)
        }

        async fn delete(&self, _queue_url: &str, receipt_handle: &str) -> Result<(), PollerError> {
            self.deleted.lock().unwrap().push(receipt_handle.to_string());
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    pub(crate) struct RecordingInvoker {
        pub calls: Mutex<Vec<(FunctionName, serde_json::Value)>>,
        pub fail: bool,
    }

    #[async_trait]
    impl Invoker for RecordingInvoker {
        async fn invoke_event(&self, name: &FunctionName, payload: Bytes) -> NimbusResult<Bytes> {
            let event = serde_json::from_slice(&payload).unwrap();
            self.calls.lock().unwrap().push((name.clone(), event));
            if self.fail {
                return Err(NimbusError::InvocationFailed {
                    name: name.to_string(),
                    status: 500,
                });
            }
            Ok(Bytes::new())
        }
    }
}
