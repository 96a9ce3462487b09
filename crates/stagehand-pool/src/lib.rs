//! Bounded multiprocessing task pool.
//!
//! Runs independently-scripted build/test jobs as real OS processes with a
//! caller-chosen concurrency ceiling. Each task gets its own log file, its
//! output is echoed back once the process is reaped, and a pool can be torn
//! down early either gracefully ([`TaskPool::kill`]) or fail-fast from
//! within [`TaskPool::join`].
//!
//! Typical usage runs one pool per phase:
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use stagehand_pool::TaskPool;
//!
//! let mut pool = TaskPool::new("parallel", "stagehand-logs")?;
//! pool.submit("numpy", ".", "make test")?;
//! pool.submit("astropy", ".", "make test")?;
//! let failures = pool.join(4, true).await?;
//! pool.summary();
//! # Ok(())
//! # }
//! ```

pub mod gate;
pub mod join;
pub mod pool;
pub mod slot;

pub use nix::sys::signal::Signal;

pub use gate::{GatePermit, SpawnGate};
pub use join::JoinError;
pub use pool::{PoolError, TaskPool, MAX_TASKS};
pub use slot::{TaskSlot, TaskState};
