//! Berth Components - resolution, fetching, supervision and sharing of
//! component processes.
//!
//! An app declares the components it needs in an [`AppManifest`]. For each
//! one the [`ComponentManager`]:
//!
//! 1. resolves the requirement to a concrete version, cache first and then
//!    the remote [`VersionHistory`] ([`Resolver`]);
//! 2. makes the artifact available locally, verifying its integrity and
//!    extracting frontend bundles ([`Fetcher`]);
//! 3. starts a backend process, or shares one already running, and keeps
//!    it supervised ([`Coordinator`], [`Supervisor`]).
//!
//! Instances are identified by `(scope, componentId)` and may run several
//! majors side by side. Version pins ([`VersionOverrides`]) never take
//! effect before a host restart.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod cache;
pub mod control;
pub mod coordinator;
pub mod datadir;
pub mod descriptor;
#[cfg(feature = "http")]
mod download;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod history;
pub mod integrity;
pub mod manager;
pub mod manifest;
pub mod overrides;
mod persist;
pub mod process;
pub mod registry;
pub mod resolver;
pub mod restart;
pub mod source;
pub mod store;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use cache::{ArtifactCache, CacheEntry, CacheKey};
pub use control::{ComponentStatus, ControlClient, ControlEndpoint, TcpControlClient};
pub use coordinator::{AcquireRequest, Coordinator};
pub use datadir::{CopyMigration, DataDirectoryKey, MigrationHook, NoMigration};
pub use descriptor::{ArtifactRef, ComponentDescriptor, ResolvedVersion};
pub use error::{ComponentError, ComponentResult};
pub use fetch::{FetchOptions, Fetcher, LocalArtifact};
pub use history::{NewArtifact, VersionHistory, publish};
pub use integrity::Integrity;
pub use manager::{ComponentManager, LaunchedApp, ManagerBuilder};
pub use manifest::{AppManifest, ManifestComponent, Platform};
pub use overrides::{Actor, OverrideOutcome, OverrideStatus, VersionOverride, VersionOverrides};
pub use process::{ExitReport, LaunchConfig, LaunchSpec, OsProcessLauncher, ProcessHandle, ProcessLauncher};
pub use registry::{ComponentState, InstanceId, RunningComponent};
pub use resolver::{ResolveOptions, Resolver};
pub use restart::{Backoff, CrashLoopGuard, RestartPolicy};
pub use source::ArtifactSource;
pub use store::{ContentAddress, ContentStore, DirectoryStore, WritableStore};
#[cfg(feature = "http")]
pub use store::HttpStore;
pub use supervisor::{PolicyBook, Supervisor, SupervisorSettings};
