//! Confab Common - Shared errors, configuration, and logging for the confab workspace.
//!
//! This crate provides:
//! - Configuration types and loading
//! - Error types and handling utilities
//! - Logging setup and structured logging helpers
//! - Call metrics collection

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    CallConfig, Config, MemoryConfig, ObservabilityConfig, SessionConfig, TransportConfig,
};
pub use error::{Error, Result, ResultExt};
pub use logging::{Metrics, MetricsSummary};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result, ResultExt};
    pub use crate::logging::init_logging;
}
