//! Manual version overrides.
//!
//! A user may pin a component to an exact version. Pins never take effect
//! immediately: a request is recorded as *pending* and becomes *active* only
//! when the host restarts. In a multi-client deployment only administrators
//! may request pins or trigger that restart; everyone else is told to contact
//! an administrator and nothing is recorded.

use std::path::PathBuf;

use berth_config::{DeploymentMode, DeploymentSection};
use berth_core::{ComponentId, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ComponentError, ComponentResult};
use crate::persist::{self, StateFile};

/// Whether a pin is waiting for a restart or in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideStatus {
    /// Recorded; takes effect at the next host restart.
    Pending,
    /// In effect.
    Active,
}

/// One pinned version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionOverride {
    /// Pinned component.
    pub component_id: ComponentId,
    /// Pinned version.
    pub version: Version,
    /// Pending or active.
    pub status: OverrideStatus,
    /// Who asked for it.
    pub requested_by: String,
    /// When it was asked for.
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OverrideFile {
    schema_version: u32,
    #[serde(rename = "override", default)]
    overrides: Vec<VersionOverride>,
}

impl Default for OverrideFile {
    fn default() -> Self {
        Self {
            schema_version: Self::SCHEMA_VERSION,
            overrides: Vec::new(),
        }
    }
}

impl StateFile for OverrideFile {
    const SCHEMA_VERSION: u32 = 1;
    const KIND: &'static str = "version overrides";

    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

/// The user asking for an override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    /// User id.
    pub user: String,
}

impl Actor {
    /// An actor named `user`.
    #[must_use]
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }

    /// The user running this process, from `$USER`/`$USERNAME`.
    #[must_use]
    pub fn current() -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "local".to_string());
        Self { user }
    }
}

/// Result of [`VersionOverrides::request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverrideOutcome {
    /// Recorded. The user must confirm a restart of this host.
    RestartRequired,
    /// Recorded. An administrator must restart the shared host.
    AdminRestartRequired,
    /// Not recorded; the caller is not an administrator.
    ContactAdministrator {
        /// Text to show the user.
        message: String,
    },
}

/// Persistent store of version pins.
#[derive(Debug, Clone)]
pub struct VersionOverrides {
    path: PathBuf,
    mode: DeploymentMode,
    administrators: Vec<String>,
}

impl VersionOverrides {
    /// Overrides stored at `path` under the given deployment settings.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, deployment: &DeploymentSection) -> Self {
        Self {
            path: path.into(),
            mode: deployment.mode,
            administrators: deployment.administrators.clone(),
        }
    }

    /// Whether `actor` may pin versions and restart the host.
    #[must_use]
    pub fn is_admin(&self, actor: &Actor) -> bool {
        match self.mode {
            DeploymentMode::SingleProcess => true,
            DeploymentMode::MultiClient => self.administrators.iter().any(|a| a == &actor.user),
        }
    }

    /// Ask for `component` to be pinned at `version`.
    ///
    /// # Errors
    ///
    /// Returns an error if the override file cannot be updated.
    pub fn request(
        &self,
        component: &ComponentId,
        version: Version,
        actor: &Actor,
    ) -> ComponentResult<OverrideOutcome> {
        if !self.is_admin(actor) {
            info!(component_id = %component, user = %actor.user, "Override refused, not an administrator");
            return Ok(OverrideOutcome::ContactAdministrator {
                message: format!(
                    "Only an administrator can pin {component} to version {version}. \
                     Please contact your administrator."
                ),
            });
        }

        persist::update::<OverrideFile, _, _>(&self.path, |file| {
            file.overrides
                .retain(|o| !(o.component_id == *component && o.status == OverrideStatus::Pending));
            file.overrides.push(VersionOverride {
                component_id: component.clone(),
                version,
                status: OverrideStatus::Pending,
                requested_by: actor.user.clone(),
                requested_at: Utc::now(),
            });
            Ok(())
        })?;
        info!(component_id = %component, %version, user = %actor.user, "Version override pending restart");

        Ok(match self.mode {
            DeploymentMode::SingleProcess => OverrideOutcome::RestartRequired,
            DeploymentMode::MultiClient => OverrideOutcome::AdminRestartRequired,
        })
    }

    /// Promote pending pins on behalf of `actor`, as part of a host restart.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::OverrideDenied`] if `actor` is not allowed to
    /// restart the host.
    pub fn activate_pending(&self, actor: &Actor) -> ComponentResult<Vec<VersionOverride>> {
        if !self.is_admin(actor) {
            return Err(ComponentError::OverrideDenied {
                message: "only an administrator can restart the host. Please contact your \
                          administrator."
                    .to_string(),
            });
        }
        self.promote()
    }

    /// Promote pending pins unconditionally. Called when the host starts.
    ///
    /// # Errors
    ///
    /// Returns an error if the override file cannot be updated.
    pub fn promote(&self) -> ComponentResult<Vec<VersionOverride>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let (_, activated) = persist::update::<OverrideFile, _, _>(&self.path, |file| {
            let pending: Vec<ComponentId> = file
                .overrides
                .iter()
                .filter(|o| o.status == OverrideStatus::Pending)
                .map(|o| o.component_id.clone())
                .collect();
            file.overrides
                .retain(|o| !(o.status == OverrideStatus::Active && pending.contains(&o.component_id)));
            let mut activated = Vec::new();
            for o in &mut file.overrides {
                if o.status == OverrideStatus::Pending {
                    o.status = OverrideStatus::Active;
                    activated.push(o.clone());
                }
            }
            Ok(activated)
        })?;
        for o in &activated {
            info!(component_id = %o.component_id, version = %o.version, "Version override active");
        }
        Ok(activated)
    }

    /// The active pin for `component`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the override file cannot be read.
    pub fn active(&self, component: &ComponentId) -> ComponentResult<Option<Version>> {
        Ok(self
            .list()?
            .into_iter()
            .find(|o| o.component_id == *component && o.status == OverrideStatus::Active)
            .map(|o| o.version))
    }

    /// Every recorded pin.
    ///
    /// # Errors
    ///
    /// Returns an error if the override file cannot be read.
    pub fn list(&self) -> ComponentResult<Vec<VersionOverride>> {
        persist::load_or_default::<OverrideFile>(&self.path).map(|f| f.overrides)
    }

    /// Remove every pin for `component`. Returns whether anything was removed.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::OverrideDenied`] for non-administrators in a
    /// multi-client deployment, or an error if the file cannot be updated.
    pub fn clear(&self, component: &ComponentId, actor: &Actor) -> ComponentResult<bool> {
        if !self.is_admin(actor) {
            return Err(ComponentError::OverrideDenied {
                message: format!("only an administrator can unpin {component}"),
            });
        }
        if !self.path.exists() {
            return Ok(false);
        }
        let (_, removed) = persist::update::<OverrideFile, _, _>(&self.path, |file| {
            let before = file.overrides.len();
            file.overrides.retain(|o| o.component_id != *component);
            Ok(file.overrides.len() != before)
        })?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notes() -> ComponentId {
        ComponentId::from_static("com.example.notes")
    }

    fn single(dir: &tempfile::TempDir) -> VersionOverrides {
        VersionOverrides::new(dir.path().join("overrides.toml"), &DeploymentSection::default())
    }

    fn multi(dir: &tempfile::TempDir) -> VersionOverrides {
        VersionOverrides::new(
            dir.path().join("overrides.toml"),
            &DeploymentSection {
                mode: DeploymentMode::MultiClient,
                administrators: vec!["root".to_string()],
                ..DeploymentSection::default()
            },
        )
    }

    #[test]
    fn single_process_override_is_deferred() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = single(&dir);
        let outcome = overrides
            .request(&notes(), Version::new(1, 2, 0), &Actor::new("alice"))
            .unwrap();
        assert_eq!(outcome, OverrideOutcome::RestartRequired);
        assert_eq!(overrides.active(&notes()).unwrap(), None);

        let activated = overrides.promote().unwrap();
        assert_eq!(activated.len(), 1);
        assert_eq!(overrides.active(&notes()).unwrap(), Some(Version::new(1, 2, 0)));
    }

    #[test]
    fn newer_request_replaces_active_pin_on_restart() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = single(&dir);
        let me = Actor::new("alice");
        overrides.request(&notes(), Version::new(1, 2, 0), &me).unwrap();
        overrides.promote().unwrap();
        overrides.request(&notes(), Version::new(1, 1, 0), &me).unwrap();
        assert_eq!(overrides.active(&notes()).unwrap(), Some(Version::new(1, 2, 0)));
        overrides.promote().unwrap();
        assert_eq!(overrides.active(&notes()).unwrap(), Some(Version::new(1, 1, 0)));
        assert_eq!(overrides.list().unwrap().len(), 1);
    }

    #[test]
    fn multi_client_non_admin_is_told_to_contact_admin() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = multi(&dir);
        let outcome = overrides
            .request(&notes(), Version::new(1, 2, 0), &Actor::new("alice"))
            .unwrap();
        assert!(matches!(outcome, OverrideOutcome::ContactAdministrator { ref message } if message.contains("administrator")));
        assert!(overrides.list().unwrap().is_empty());
        assert!(matches!(
            overrides.activate_pending(&Actor::new("alice")),
            Err(ComponentError::OverrideDenied { .. })
        ));
    }

    #[test]
    fn multi_client_admin_restart_activates() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = multi(&dir);
        let root = Actor::new("root");
        assert_eq!(
            overrides.request(&notes(), Version::new(2, 0, 1), &root).unwrap(),
            OverrideOutcome::AdminRestartRequired
        );
        overrides.activate_pending(&root).unwrap();
        assert_eq!(overrides.active(&notes()).unwrap(), Some(Version::new(2, 0, 1)));
    }

    #[test]
    fn clear_removes_pins() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = single(&dir);
        let me = Actor::new("alice");
        assert!(!overrides.clear(&notes(), &me).unwrap());
        overrides.request(&notes(), Version::new(1, 0, 0), &me).unwrap();
        assert!(overrides.clear(&notes(), &me).unwrap());
        assert!(overrides.list().unwrap().is_empty());
    }
}
