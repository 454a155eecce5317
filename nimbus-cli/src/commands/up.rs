// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `nimbus up` command - Start the emulator.
//!
//! Runs the ordered startup pipeline, serves the gateway until Ctrl+C, then
//! stops the listener and every container it started.

use std::sync::Arc;

use nimbus_core::{ConfigLoader, Emulator};

use crate::{gateway, metrics};

pub async fn execute(config_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(config = %config_path, "Starting emulator");

    // Load and validate configuration - fail fast on invalid config
    let config = ConfigLoader::load_file_or_default(config_path)?;
    let gateway_port = config.gateway_port.value();
    let metrics_port = config.metrics_port.value();

    let emulator = Arc::new(Emulator::connect(config)?);

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                    NIMBUS CLOUD EMULATOR                     ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let replayed = match emulator.startup().await {
        Ok(replayed) => replayed,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            // Do not leave half the containers behind.
            if let Err(cleanup) = emulator.shutdown().await {
                tracing::error!(error = %cleanup, "Cleanup after failed startup incomplete");
            }
            return Err(e.into());
        }
    };
    metrics::REPLAYED_REQUESTS.inc_by(replayed as u64);
    metrics::start_metrics_server(metrics_port, emulator.clone());

    let running = emulator.router().running();
    println!("  Replayed requests:  {}", replayed);
    println!("  Event sources:      {}", emulator.poller().running_count());
    println!("  Functions:          {}", running.len());
    for name in &running {
        if let Some(port) = emulator.router().port_of(name) {
            println!("    ● {:<20} → http://localhost:{}", name.as_str(), port);
        }
    }
    println!();
    println!("  Gateway:            http://localhost:{}", gateway_port);
    println!("  Metrics:            http://localhost:{}/metrics", metrics_port);
    println!();
    println!("Press Ctrl+C to stop...");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Unable to listen for Ctrl+C");
        }
        println!();
        println!("Shutting down...");
    };
    let served = gateway::start_gateway(gateway_port, emulator.clone(), shutdown).await;

    tracing::info!("Stopping containers");
    let stopped = emulator.shutdown().await;

    if let Err(e) = served {
        return Err(e.to_string().into());
    }
    stopped?;

    println!("Emulator stopped.");
    Ok(())
}
