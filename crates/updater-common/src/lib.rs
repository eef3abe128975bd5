//! Updater Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared plumbing for the updater workspace members:
//!
//! - **Error Handling**: [`UpdaterError`] for configuration and bootstrap failures
//! - **Environment**: typed readers for `KEY=value` settings with defaults
//! - **Logging**: console/file/JSON subscriber setup and the [`alert!`] macro
//!
//! # Example
//!
//! ```no_run
//! use updater_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> updater_common::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     init_logging(&config)?;
//!     tracing::info!("Updater starting");
//!     Ok(())
//! }
//! ```

pub mod env;
pub mod error;
pub mod logging;

pub use error::{Result, UpdaterError};

/// Emit an error event flagged for operator alerting.
///
/// Alerting sinks filter on the `alert = true` field; everything else about
/// the event is a regular `tracing::error!`.
#[macro_export]
macro_rules! alert {
    ($($arg:tt)+) => {
        ::tracing::error!(alert = true, $($arg)+)
    };
}
