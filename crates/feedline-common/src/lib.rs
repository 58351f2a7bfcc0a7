//! Feedline Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities for the feedline workspace.
//!
//! # Overview
//!
//! - **Error Handling**: the [`CommonError`] type shared by every crate
//! - **Logging**: subscriber setup driven by `FEEDLINE_LOG_*` variables
//! - **Time**: the minimum storable timestamp and saturating arithmetic used
//!   for cursor defaults and lease expiry
//!
//! # Example
//!
//! ```no_run
//! use feedline_common::logging::{init_logging, LogConfig};
//! use feedline_common::time::min_timestamp;
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!(default_cursor = %min_timestamp(), "Logging ready");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod time;

// Re-export commonly used types
pub use error::{CommonError, Result};
