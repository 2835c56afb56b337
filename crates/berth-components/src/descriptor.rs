//! What callers ask for and what resolution produces.

use berth_core::{ComponentId, ComponentKind, Target, Version, VersionReq};
use serde::{Deserialize, Serialize};

use crate::integrity::Integrity;
use crate::source::ArtifactSource;

/// A component an app depends on, as declared in its manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentDescriptor {
    /// Stable component id.
    pub id: ComponentId,
    /// Display name.
    pub name: Option<String>,
    /// Frontend or backend.
    pub kind: ComponentKind,
    /// Versions the app accepts.
    pub requirement: VersionReq,
    /// Build target the artifact must satisfy.
    pub target: Target,
    /// Free-form configuration passed to the component on launch.
    pub config: serde_json::Value,
}

impl ComponentDescriptor {
    /// A descriptor for the host target (backends) or any target (frontends).
    #[must_use]
    pub fn new(id: ComponentId, kind: ComponentKind, requirement: VersionReq) -> Self {
        let target = match kind {
            ComponentKind::Backend => Target::host(),
            ComponentKind::Frontend => Target::any(),
        };
        Self {
            id,
            name: None,
            kind,
            requirement,
            target,
            config: serde_json::Value::Null,
        }
    }

    /// Override the build target.
    #[must_use]
    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    /// Attach launch configuration.
    #[must_use]
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Set the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Where to get one artifact and how to check it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Artifact location.
    pub source: ArtifactSource,
    /// Declared hash. `None` only for local development paths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<Integrity>,
    /// Declared size in bytes, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// The concrete version chosen for a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedVersion {
    /// Component id.
    pub component_id: ComponentId,
    /// Frontend or backend.
    pub kind: ComponentKind,
    /// Chosen version.
    pub version: Version,
    /// Target of the chosen artifact.
    pub target: Target,
    /// The artifact to fetch.
    pub artifact: ArtifactRef,
    /// Whether resolution was answered from the local cache.
    pub from_cache: bool,
}
