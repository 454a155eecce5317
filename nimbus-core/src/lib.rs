// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Nimbus Core Library
//!
//! Core of the Nimbus local cloud emulator. Provides versioned function and
//! layer storage, container orchestration, invocation routing, queue event
//! sources and the replay log that rebuilds emulator state across restarts.

pub mod config;
pub mod db;
pub mod docker;
pub mod emulator;
pub mod error;
pub mod invoke;
pub mod lambda;
pub mod poller;
pub mod ports;
pub mod replay;
pub mod services;
pub mod types;

// Re-export commonly used types
pub use config::{Config, ConfigLoader};
pub use db::Database;
pub use docker::{BollardRuntime, ContainerRuntime, ContainerSpec, Orchestrator};
pub use emulator::Emulator;
pub use error::{ErrorKind, HardValidationError, NimbusError, NimbusResult};
pub use invoke::{InvocationRouter, Invoker};
pub use lambda::{EventSource, Function, FunctionStore, LambdaLayer, NewFunction};
pub use poller::{EventSourcePoller, QueueClient, SqsClient};
pub use ports::PortPool;
pub use replay::ReplayLog;
pub use services::BackingService;
pub use types::{FunctionName, LayerName, LayerRef, MemorySize, Port, Runtime, Timeout};
