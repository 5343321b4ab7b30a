//! Platereg Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared plumbing for the plate registry workspace members.
//!
//! - **Logging**: `tracing` subscriber setup driven by `LOG_*` environment variables
//! - **Env**: small helpers for reading typed configuration from the environment
//!
//! # Example
//!
//! ```no_run
//! use platereg_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!("ready");
//!     Ok(())
//! }
//! ```

pub mod env;
pub mod logging;

pub use logging::{init_logging, LogConfig, LogGuard};
