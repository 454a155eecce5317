// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Prometheus metrics, served as text on the metrics port.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use nimbus_core::Emulator;

lazy_static! {
    pub static ref INVOCATIONS: IntCounterVec = register_int_counter_vec!(
        "function_invocations_total",
        "Total number of function invocations routed by the gateway",
        &["function"]
    )
    .unwrap();
    pub static ref INVOCATION_ERRORS: IntCounterVec = register_int_counter_vec!(
        "function_invocation_errors_total",
        "Invocations that failed before a response came back",
        &["function"]
    )
    .unwrap();
    pub static ref INVOCATION_DURATION: HistogramVec = register_histogram_vec!(
        "function_invocation_duration_seconds",
        "Time until the function container answered",
        &["function"],
        vec![0.005, 0.010, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();
    pub static ref REPLAYED_REQUESTS: IntCounter = register_int_counter!(
        "replayed_requests_total",
        "Recorded emulator calls replayed at startup"
    )
    .unwrap();
    pub static ref EVENT_SOURCE_DELIVERIES: IntGaugeVec = register_int_gauge_vec!(
        "event_source_deliveries",
        "Queue messages handed to functions by event source pollers",
        &["outcome"]
    )
    .unwrap();
    pub static ref RUNNING_FUNCTIONS: IntGauge = register_int_gauge!(
        "running_functions",
        "Functions with a running container"
    )
    .unwrap();
}

/// Copy counters owned by the emulator into their gauges.
fn refresh(emulator: &Emulator) {
    let stats = emulator.poller().stats();
    EVENT_SOURCE_DELIVERIES
        .with_label_values(&["delivered"])
        .set(stats.delivered.load(Ordering::Relaxed) as i64);
    EVENT_SOURCE_DELIVERIES
        .with_label_values(&["failed"])
        .set(stats.failed.load(Ordering::Relaxed) as i64);
    RUNNING_FUNCTIONS.set(emulator.router().running().len() as i64);
}

/// Start the metrics server in a background task.
pub fn start_metrics_server(port: u16, emulator: Arc<Emulator>) {
    // Force initialization of metrics
    lazy_static::initialize(&INVOCATIONS);
    lazy_static::initialize(&INVOCATION_ERRORS);
    lazy_static::initialize(&INVOCATION_DURATION);
    lazy_static::initialize(&REPLAYED_REQUESTS);
    lazy_static::initialize(&EVENT_SOURCE_DELIVERIES);
    lazy_static::initialize(&RUNNING_FUNCTIONS);

    tokio::spawn(async move {
        let addr = format!("0.0.0.0:{}", port);
        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                tracing::info!(addr = %addr, "Metrics server starting");
                loop {
                    if let Ok((mut socket, _)) = listener.accept().await {
                        refresh(&emulator);
                        tokio::spawn(async move {
                            let body = metrics_handler();
                            let response = format!(
                                "HTTP/1.0 200 OK\r\nConnection: close\r\nContent-Length: {}\r\nContent-Type: text/plain; version=0.0.4\r\n\r\n{}",
                                body.len(),
                                body
                            );
                            let _ = socket.write_all(response.as_bytes()).await;
                            let _ = socket.flush().await;
                        });
                    }
                }
            }
            Err(e) => {
                tracing::error!(addr = %addr, error = %e, "Failed to bind metrics server");
            }
        }
    });
}

fn metrics_handler() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("Encoding error"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_exported() {
        INVOCATIONS.with_label_values(&["hello"]).inc();
        REPLAYED_REQUESTS.inc_by(2);

        let text = metrics_handler();
        assert!(text.contains("function_invocations_total{function=\"hello\"}"));
        assert!(text.contains("replayed_requests_total"));
    }
}
