//! Subcommand implementations.

pub(crate) mod cache;
pub(crate) mod config;
pub(crate) mod data_dir;
pub(crate) mod launch;
pub(crate) mod overrides;
pub(crate) mod publish;
pub(crate) mod resolve;

use std::sync::Arc;

use anyhow::Context;
use berth_components::{ComponentDescriptor, ComponentManager};
use berth_config::Config;
use berth_core::{ComponentId, ComponentKind, Scope, Target, Version, VersionReq};
use clap::{Args, ValueEnum};

use crate::notifier::TerminalNotifier;

/// Component kind as typed on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum KindArg {
    /// A long-running process.
    Backend,
    /// A bundle of static files.
    Frontend,
}

impl From<KindArg> for ComponentKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Backend => Self::Backend,
            KindArg::Frontend => Self::Frontend,
        }
    }
}

/// Selects one component and a version requirement.
#[derive(Debug, Clone, Args)]
pub(crate) struct ComponentArgs {
    /// Component id
    pub component: String,

    /// Version requirement, e.g. `^1.2` or `>=1.0, <2.0`
    #[arg(default_value = "*")]
    pub requirement: String,

    /// Component kind
    #[arg(short, long, value_enum, default_value = "backend")]
    pub kind: KindArg,

    /// Build target (defaults to this host)
    #[arg(short, long)]
    pub target: Option<String>,
}

impl ComponentArgs {
    /// Parse into a descriptor.
    pub(crate) fn descriptor(&self) -> anyhow::Result<ComponentDescriptor> {
        let id = parse_component(&self.component)?;
        let requirement = VersionReq::parse(&self.requirement)
            .with_context(|| format!("invalid version requirement '{}'", self.requirement))?;
        let target = self.target.as_deref().map_or_else(Target::host, Target::new);
        Ok(ComponentDescriptor::new(id, self.kind.into(), requirement).with_target(target))
    }
}

/// Open a manager over the user's home with terminal notices.
pub(crate) fn open_manager(config: Config) -> anyhow::Result<ComponentManager> {
    ComponentManager::builder(config)
        .notifier(Arc::new(TerminalNotifier))
        .build()
        .context("failed to open the component manager")
}

pub(crate) fn parse_component(raw: &str) -> anyhow::Result<ComponentId> {
    ComponentId::new(raw).with_context(|| format!("invalid component id '{raw}'"))
}

pub(crate) fn parse_version(raw: &str) -> anyhow::Result<Version> {
    raw.parse()
        .with_context(|| format!("invalid version '{raw}'"))
}

/// Parse `--scope`, falling back to the manager's default.
pub(crate) fn parse_scope(raw: Option<&str>, manager: &ComponentManager) -> anyhow::Result<Scope> {
    match raw {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("invalid scope '{raw}'")),
        None => Ok(manager.default_scope().clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_args_become_a_descriptor() {
        let args = ComponentArgs {
            component: "ant://notes/backend".into(),
            requirement: "^1.2".into(),
            kind: KindArg::Backend,
            target: Some("x86_64-linux".into()),
        };
        let descriptor = args.descriptor().unwrap();
        assert_eq!(descriptor.id.as_str(), "ant://notes/backend");
        assert_eq!(descriptor.kind, ComponentKind::Backend);
        assert!(descriptor.requirement.matches(&Version::new(1, 4, 0)));
        assert!(!descriptor.requirement.matches(&Version::new(2, 0, 0)));
        assert_eq!(descriptor.target, Target::new("x86_64-linux"));
    }

    #[test]
    fn bad_requirement_is_reported() {
        let args = ComponentArgs {
            component: "ant://notes/backend".into(),
            requirement: "^^1".into(),
            kind: KindArg::Frontend,
            target: None,
        };
        let err = args.descriptor().unwrap_err();
        assert!(err.to_string().contains("^^1"));
    }
}
