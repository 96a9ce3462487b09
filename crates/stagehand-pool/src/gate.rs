//! Semaphore-based spawn gate for task pools.
//!
//! The [`SpawnGate`] rate-limits simultaneous spawn attempts inside a pool.
//! It is deliberately small (two permits by default): it bounds the number of
//! processes being *launched* at one moment, not the number allowed to run,
//! which is the join window's job. Permits are issued via a Tokio semaphore
//! and returned automatically when the [`GatePermit`] is dropped, including
//! on a failed spawn.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Prefix applied to every gate name, followed by the pool identity.
pub const GATE_NAME_PREFIX: &str = "stagehand_mp";

/// Default number of simultaneous spawn attempts per pool.
pub const DEFAULT_GATE_PERMITS: usize = 2;

/// A permit granting the right to attempt one process spawn.
///
/// When dropped, the permit is automatically returned to the gate.
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

/// Spawn-throttling gate owned by a single pool.
#[derive(Debug)]
pub struct SpawnGate {
    name: String,
    permits: usize,
    semaphore: Arc<Semaphore>,
}

impl SpawnGate {
    /// Create a gate for the named pool. Zero permits coerces to the default.
    pub fn new(pool_ident: &str, permits: usize) -> Self {
        let permits = if permits == 0 {
            DEFAULT_GATE_PERMITS
        } else {
            permits
        };
        let name = format!("{GATE_NAME_PREFIX}_{pool_ident}");

        debug!(target: "stagehand.gate", %name, permits, "SpawnGate created");

        Self {
            name,
            permits,
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Acquire a permit, waiting until one becomes available.
    pub async fn acquire(&self) -> Result<GatePermit, GateError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| GateError::Closed {
                name: self.name.clone(),
            })?;
        Ok(GatePermit { _permit: permit })
    }

    /// Acquire a permit without waiting. Returns `None` when the gate is full.
    pub fn try_acquire(&self) -> Option<GatePermit> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        Some(GatePermit { _permit: permit })
    }

    /// Diagnostic name of the gate (`stagehand_mp_<pool>`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Initial permit count.
    pub const fn permits(&self) -> usize {
        self.permits
    }

    /// Number of permits not currently held.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Errors from the spawn gate.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// The semaphore was closed (pool torn down mid-acquire).
    #[error("Spawn gate '{name}' has been closed")]
    Closed { name: String },
}
