// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Bounded pool of host ports for function invocation endpoints.
//!
//! The pool is process-local and rebuilt empty on every start; ports are
//! re-acquired as each persisted function's container is restarted.

use std::sync::{Arc, Mutex};

use crate::error::{NimbusError, NimbusResult};
use crate::types::Port;

/// Thread-safe allocator over an inclusive port range.
#[derive(Debug)]
pub struct PortPool {
    first: u16,
    last: u16,
    /// `in_use[i]` tracks port `first + i`.
    in_use: Mutex<Vec<bool>>,
}

impl PortPool {
    /// Create a pool over `first..=last`.
    pub fn new(first: u16, last: u16) -> Self {
        let size = if last >= first {
            usize::from(last - first) + 1
        } else {
            0
        };
        Self {
            first,
            last,
            in_use: Mutex::new(vec![false; size]),
        }
    }

    /// Create a pool wrapped in an Arc for sharing across tasks.
    pub fn new_shared(first: u16, last: u16) -> Arc<Self> {
        Arc::new(Self::new(first, last))
    }

    /// Acquire the lowest free port.
    pub fn acquire(&self) -> NimbusResult<Port> {
        let mut in_use = self.lock();
        let slot = in_use
            .iter()
            .position(|used| !used)
            .ok_or(NimbusError::PortPoolExhausted {
                first: self.first,
                last: self.last,
            })?;

        in_use[slot] = true;
        // The range was bounded by u16 at construction.
        let port = self.first + slot as u16;
        tracing::debug!(port = port, "Acquired port");
        Ok(Port::new(port)?)
    }

    /// Acquire the lowest free port as a lease that hands it back on drop.
    pub fn lease(&self) -> NimbusResult<PortLease<'_>> {
        Ok(PortLease {
            pool: self,
            port: self.acquire()?,
            kept: false,
        })
    }

    /// Return a port to the pool. Unknown or already-free ports are ignored.
    pub fn release(&self, port: Port) {
        let value = port.value();
        if value < self.first || value > self.last {
            return;
        }

        let mut in_use = self.lock();
        let slot = usize::from(value - self.first);
        if std::mem::replace(&mut in_use[slot], false) {
            tracing::debug!(port = value, "Released port");
        }
    }

    /// Number of ports currently handed out.
    pub fn in_use(&self) -> usize {
        self.lock().iter().filter(|used| **used).count()
    }

    /// Total size of the range.
    pub fn capacity(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<bool>> {
        self.in_use.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A port held while its owner is being set up.
///
/// Dropping the lease releases the port; [`PortLease::keep`] takes it out of
/// the lease for good.
#[derive(Debug)]
pub struct PortLease<'a> {
    pool: &'a PortPool,
    port: Port,
    kept: bool,
}

impl PortLease<'_> {
    pub fn port(&self) -> Port {
        self.port
    }

    pub fn keep(mut self) -> Port {
        self.kept = true;
        self.port
    }
}

impl Drop for PortLease<'_> {
    fn drop(&mut self) {
        if !self.kept {
            self.pool.release(self.port);
        }
    }
}
