//! Application manifests.
//!
//! An app manifest is a JSON document naming the app and the frontend and
//! backend components it needs:
//!
//! ```json
//! {
//!   "id": "ant://apps/notes",
//!   "name": "Notes",
//!   "version": "1.4.0",
//!   "iconUri": "ant://.../icon.png",
//!   "description": "Encrypted notes",
//!   "components": [
//!     { "id": "ant://notes/ui", "name": "Notes UI", "kind": "frontend",
//!       "versionRequirement": "^1.4", "platform": "desktop" },
//!     { "id": "ant://notes/backend", "name": "Notes backend", "kind": "backend",
//!       "versionRequirement": "~1.4.2", "config": { "sync": true } }
//!   ]
//! }
//! ```

use std::collections::{HashMap, HashSet};

use berth_core::{ComponentId, ComponentKind, Target, Version, VersionReq};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::descriptor::ComponentDescriptor;
use crate::error::{ComponentError, ComponentResult};

/// A parsed and validated app manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppManifest {
    /// App id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// App version.
    pub version: String,
    /// Icon location.
    pub icon_uri: String,
    /// Short description.
    pub description: String,
    /// Publisher name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    /// Components the app depends on.
    pub components: Vec<ManifestComponent>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

/// Frontend platform names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Desktop webview.
    Desktop,
    /// iOS webview.
    #[serde(alias = "iOS")]
    Ios,
    /// Android webview.
    #[serde(alias = "Android")]
    Android,
}

/// One component entry of an app manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestComponent {
    /// Component id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Frontend or backend.
    pub kind: ComponentKind,
    /// Accepted versions.
    #[serde(alias = "version")]
    pub version_requirement: String,
    /// Frontend platform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    /// Backend build target. Defaults to the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Launch configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

impl AppManifest {
    /// Parse and validate a manifest from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::InvalidManifest`] if the payload is not UTF-8,
    /// not valid JSON, or fails validation.
    pub fn from_bytes(bytes: &[u8]) -> ComponentResult<Self> {
        let text = std::str::from_utf8(bytes).map_err(|e| invalid(format!("not UTF-8: {e}")))?;
        Self::from_json(text)
    }

    /// Parse and validate a manifest from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::InvalidManifest`] if the JSON is malformed
    /// or fails validation.
    pub fn from_json(json: &str) -> ComponentResult<Self> {
        let manifest: Self =
            serde_json::from_str(json).map_err(|e| invalid(format!("malformed JSON: {e}")))?;
        manifest.validate()?;
        debug!(
            app_id = %manifest.id,
            components = manifest.components.len(),
            "Parsed app manifest"
        );
        Ok(manifest)
    }

    /// Check the manifest for structural problems.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::InvalidManifest`] naming the first problem.
    pub fn validate(&self) -> ComponentResult<()> {
        if self.id.trim().is_empty() {
            return Err(invalid("app id is empty".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(invalid("app name is empty".to_string()));
        }
        Version::parse(&self.version)
            .map_err(|e| invalid(format!("app version: {e}")))?;

        let mut seen = HashSet::new();
        for (idx, component) in self.components.iter().enumerate() {
            component
                .validate()
                .map_err(|message| invalid(format!("component {idx}: {message}")))?;
            if !seen.insert(component.id.as_str()) {
                return Err(invalid(format!(
                    "component {idx}: duplicate id '{}'",
                    component.id
                )));
            }
        }
        Ok(())
    }

    /// Descriptors for every component, in manifest order.
    ///
    /// # Errors
    ///
    /// Returns an error if a component id or requirement is invalid. Only
    /// reachable for manifests built in code without [`AppManifest::validate`].
    pub fn descriptors(&self) -> ComponentResult<Vec<ComponentDescriptor>> {
        self.components
            .iter()
            .map(ManifestComponent::descriptor)
            .collect()
    }
}

impl ManifestComponent {
    fn validate(&self) -> Result<(), String> {
        ComponentId::new(self.id.as_str()).map_err(|e| e.to_string())?;
        if self.name.trim().is_empty() {
            return Err("name is empty".to_string());
        }
        VersionReq::parse(&self.version_requirement).map_err(|e| e.to_string())?;
        match self.kind {
            ComponentKind::Frontend if self.target.is_some() => {
                Err("frontend components cannot declare a target".to_string())
            },
            ComponentKind::Backend if self.platform.is_some() => {
                Err("backend components cannot declare a platform".to_string())
            },
            _ => Ok(()),
        }
    }

    /// The descriptor this entry declares.
    ///
    /// # Errors
    ///
    /// Returns an error if the id or requirement is invalid.
    pub fn descriptor(&self) -> ComponentResult<ComponentDescriptor> {
        let id = ComponentId::new(self.id.as_str())
            .map_err(|e| invalid(format!("component id '{}': {e}", self.id)))?;
        let requirement = VersionReq::parse(&self.version_requirement)?;
        let mut descriptor =
            ComponentDescriptor::new(id, self.kind, requirement).with_name(self.name.clone());
        if let Some(target) = &self.target {
            descriptor = descriptor.with_target(Target::new(target.clone()));
        }
        if let Some(config) = &self.config {
            descriptor = descriptor.with_config(config.clone());
        }
        Ok(descriptor)
    }
}

fn invalid(message: String) -> ComponentError {
    ComponentError::InvalidManifest { message }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOTES: &str = r#"{
        "id": "ant://apps/notes",
        "name": "Notes",
        "version": "1.4.0",
        "iconUri": "ant://icons/notes.png",
        "description": "Encrypted notes",
        "components": [
            { "id": "ant://notes/ui", "name": "Notes UI", "kind": "frontend",
              "versionRequirement": "^1.4", "platform": "desktop" },
            { "id": "ant://notes/backend", "name": "Notes backend", "kind": "backend",
              "version": "~1.4.2", "config": { "sync": true } }
        ]
    }"#;

    #[test]
    fn parses_and_builds_descriptors() {
        let manifest = AppManifest::from_json(NOTES).unwrap();
        assert_eq!(manifest.icon_uri, "ant://icons/notes.png");

        let descriptors = manifest.descriptors().unwrap();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].kind, ComponentKind::Frontend);
        assert_eq!(descriptors[0].target, Target::any());
        assert_eq!(descriptors[1].requirement.as_str(), "~1.4.2");
        assert_eq!(descriptors[1].target, Target::host());
        assert_eq!(descriptors[1].config["sync"], serde_json::json!(true));
    }

    #[test]
    fn accepts_legacy_platform_spelling() {
        let json = NOTES.replace("\"desktop\"", "\"iOS\"");
        let manifest = AppManifest::from_json(&json).unwrap();
        assert_eq!(manifest.components[0].platform, Some(Platform::Ios));
    }

    #[test]
    fn rejects_bad_requirement() {
        let json = NOTES.replace("~1.4.2", "~>1.4");
        let err = AppManifest::from_json(&json).unwrap_err();
        assert!(matches!(err, ComponentError::InvalidManifest { .. }));
        assert!(err.to_string().contains("component 1"));
    }

    #[test]
    fn rejects_duplicate_components() {
        let json = NOTES.replace("ant://notes/ui", "ant://notes/backend");
        let err = AppManifest::from_json(&json).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn rejects_frontend_target() {
        let json = NOTES.replace(
            "\"platform\": \"desktop\"",
            "\"target\": \"x86_64-linux\"",
        );
        assert!(AppManifest::from_json(&json).is_err());
    }

    #[test]
    fn rejects_bad_app_version_and_encoding() {
        let json = NOTES.replace("\"1.4.0\"", "\"1.4\"");
        assert!(AppManifest::from_json(&json).is_err());
        assert!(AppManifest::from_bytes(&[0xff, 0xfe]).is_err());
        assert!(AppManifest::from_json("{").is_err());
    }
}
