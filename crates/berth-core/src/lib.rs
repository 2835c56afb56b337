//! Berth Core - Foundation types for the Berth component lifecycle manager.
//!
//! This crate provides:
//! - [`Version`] and the requirement language matched against it ([`VersionReq`])
//! - Component identity: [`ComponentId`], [`ComponentKind`], [`Target`], [`Scope`]
//! - The user-notice channel ([`Notice`], [`Notifier`])
//! - The on-disk home layout ([`BerthHome`])

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

pub mod component;
pub mod dirs;
pub mod notice;
pub mod requirement;
pub mod version;

pub use component::{ComponentId, ComponentIdError, ComponentKind, Scope, Target};
pub use dirs::BerthHome;
pub use notice::{LogNotifier, Notice, NoticeLevel, Notifier};
pub use requirement::{Comparator, Op, RequirementParseError, VersionReq};
pub use version::{CompatLine, Version, VersionParseError};
