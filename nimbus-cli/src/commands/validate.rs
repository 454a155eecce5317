// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `nimbus validate` command - Validate configuration file.

use nimbus_core::ConfigLoader;

pub async fn execute(file: &str) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(file = %file, "Validating configuration");

    match ConfigLoader::load_file(file) {
        Ok(config) => {
            let (first, last) = config.lambda.port_range();
            println!("✓ Configuration is valid");
            println!();
            println!("Emulator Settings:");
            println!("  Account:            {}", config.account_number);
            println!("  Region:             {}", config.region);
            println!("  Data Path:          {}", config.data_path.display());
            println!("  Gateway Port:       {}", config.gateway_port);
            println!("  Metrics Port:       {}", config.metrics_port);
            println!("  Function Ports:     {}-{}", first, last);
            println!("  Runtime Images:     {}:<runtime>", config.lambda.runtime_image_prefix);
            println!();
            println!("Backing Services:");
            for (name, service) in [("s3", &config.s3), ("sqs", &config.sqs), ("moto", &config.moto)] {
                println!("  - {:<5} {} ({})", name, service.base_url(), service.image);
            }
            println!();
            println!("Runtimes ({}):", config.lambda.runtimes.len());
            for runtime in &config.lambda.runtimes {
                println!("  - {}", runtime);
            }
            println!();
            println!("Timeouts:");
            println!("  Stop Grace:         {}s", config.timeouts.stop_grace.as_secs());
            println!("  Upstream:           {}s", config.timeouts.upstream.as_secs());
            println!("  Poll Wait:          {}s", config.timeouts.poll_wait.as_secs());
            println!("  Readiness:          {}s", config.timeouts.readiness.as_secs());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}
