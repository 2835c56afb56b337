//! Resolve and fetch commands.

use berth_components::{ComponentManager, ResolveOptions, ResolvedVersion};

use super::{ComponentArgs, parse_version};
use crate::theme::Theme;

/// Print which version a requirement resolves to.
pub(crate) async fn resolve(
    manager: &ComponentManager,
    args: &ComponentArgs,
    force_version: Option<&str>,
    refresh: bool,
) -> anyhow::Result<()> {
    let resolved = resolve_version(manager, args, force_version, refresh).await?;

    println!("\n{}", Theme::header("Resolved"));
    print_resolved(&resolved);
    println!();
    Ok(())
}

/// Resolve and download, printing where the artifact landed.
pub(crate) async fn fetch(
    manager: &ComponentManager,
    args: &ComponentArgs,
    force_version: Option<&str>,
    refresh: bool,
) -> anyhow::Result<()> {
    let resolved = resolve_version(manager, args, force_version, refresh).await?;
    let local = manager.ensure_local(&resolved).await?;

    let verb = if local.cached { "Already cached" } else { "Fetched" };
    println!(
        "{}",
        Theme::success(&format!("{verb} {} {}", local.key.component_id, local.key.version))
    );
    println!("{}", Theme::kv("Path", &local.path.display().to_string()));
    println!();
    Ok(())
}

async fn resolve_version(
    manager: &ComponentManager,
    args: &ComponentArgs,
    force_version: Option<&str>,
    refresh: bool,
) -> anyhow::Result<ResolvedVersion> {
    let descriptor = args.descriptor()?;
    let resolved = match force_version {
        Some(raw) => {
            let options = ResolveOptions {
                force_version: Some(parse_version(raw)?),
                refresh,
            };
            manager.resolve_with(&descriptor, &options).await?
        },
        None if refresh => {
            let options = ResolveOptions {
                force_version: None,
                refresh,
            };
            manager.resolve_with(&descriptor, &options).await?
        },
        None => manager.resolve(&descriptor).await?,
    };
    Ok(resolved)
}

fn print_resolved(resolved: &ResolvedVersion) {
    println!("{}", Theme::kv("Component", resolved.component_id.as_str()));
    println!("{}", Theme::kv("Kind", &resolved.kind.to_string()));
    println!("{}", Theme::kv("Version", &resolved.version.to_string()));
    println!("{}", Theme::kv("Target", resolved.target.as_str()));
    println!("{}", Theme::kv("Source", &resolved.artifact.source.to_string()));
    if let Some(integrity) = &resolved.artifact.integrity {
        println!("{}", Theme::kv("Integrity", &integrity.to_string()));
    }
    let origin = if resolved.from_cache {
        "local cache"
    } else {
        "version history"
    };
    println!("{}", Theme::kv("From", &Theme::dimmed(origin)));
}
