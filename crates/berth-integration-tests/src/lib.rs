//! Integration test crate for Berth.
//!
//! This crate exists solely for end-to-end testing. It is `publish = false`
//! and has no library code: the `fixture-component` binary is a real
//! component process, and all tests live in `tests/`.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
