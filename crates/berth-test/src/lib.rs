//! Berth Test - Shared test utilities for the Berth crates.
//!
//! This crate provides mock implementations and fixtures that can be used
//! across multiple Berth crates as a dev-dependency.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! berth-test.workspace = true
//! ```
//!
//! ```rust,ignore
//! use berth_test::{RecordingNotifier, TestHome};
//!
//! let home = TestHome::new();
//! let notices = RecordingNotifier::new();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod fixtures;
pub mod harness;
pub mod mocks;

pub use fixtures::*;
pub use harness::*;
pub use mocks::*;
