//! Berth Telemetry - Logging for the Berth component lifecycle manager.
//!
//! # Example
//!
//! ```rust,no_run
//! use berth_telemetry::{LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), berth_telemetry::TelemetryError> {
//! let config = LogConfig::new("debug")
//!     .with_format(LogFormat::Pretty)
//!     .with_directive("berth_components=trace");
//!
//! setup_logging(&config)?;
//! tracing::info!("logging ready");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{FileRotation, LogConfig, LogFormat, LogTarget, setup_logging};
