//! Stagehand Core Library
//!
//! Shared functionality for Stagehand components:
//! - Runner settings resolution (defaults, `stagehand.toml`, environment)
//! - Common error types
//! - Tracing/logging initialisation

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::Settings;
pub use error::{Error, Result};
pub use tracing_init::{LogFormat, init_tracing};
