// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `nimbus list` command - List deployed functions.
//!
//! Reads the durable store directly; the emulator does not need to run.

use std::sync::Arc;

use nimbus_core::{ConfigLoader, Database, FunctionStore};

pub async fn execute(config_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigLoader::load_file_or_default(config_path)?;
    let db_path = config.database_path();

    if !db_path.exists() {
        println!("No functions deployed.");
        return Ok(());
    }

    let db = Arc::new(Database::open(&db_path)?);
    db.migrate(nimbus_core::lambda::MIGRATIONS)?;
    let store = FunctionStore::new(db, config.data_path.clone());
    let functions = store.latest_functions()?;

    if functions.is_empty() {
        println!("No functions deployed.");
        return Ok(());
    }

    println!("╔══════════════════════════════════════════════════════════════════════════════╗");
    println!("║                             DEPLOYED FUNCTIONS                               ║");
    println!("╠═══════════════════╦═════════╦══════════════╦════════════╦════════════════════╣");
    println!("║ Name              ║ Version ║ Runtime      ║ Memory     ║ Handler            ║");
    println!("╠═══════════════════╬═════════╬══════════════╬════════════╬════════════════════╣");

    for function in &functions {
        println!(
            "║ {:<17} ║ {:<7} ║ {:<12} ║ {:<10} ║ {:<18} ║",
            function.name.as_str(),
            function.version,
            function.runtime.as_str(),
            format!("{}", function.memory_size),
            function.handler
        );
    }

    println!("╚═══════════════════╩═════════╩══════════════╩════════════╩════════════════════╝");
    println!();
    println!("Total: {} function(s)", functions.len());

    Ok(())
}
