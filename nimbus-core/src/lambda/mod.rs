// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Function and layer deployment model.
//!
//! Provides the persisted data model, the versioned store and the helpers
//! for deployment packages.

pub mod archive;
pub mod model;
pub mod store;

pub use model::{EventSource, Function, LambdaLayer, NewFunction};
pub use store::{EnvironmentDiff, FunctionStore, MIGRATIONS};
