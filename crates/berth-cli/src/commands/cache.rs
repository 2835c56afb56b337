//! Cache command: inspect and trim the local artifact cache.

use berth_components::{CacheKey, ComponentManager};
use berth_core::Target;
use colored::Colorize;

use super::{parse_component, parse_version};
use crate::theme::Theme;

/// List cached artifacts, most recently used first.
pub(crate) fn list_cache(manager: &ComponentManager) {
    let entries = manager.cached();
    if entries.is_empty() {
        println!("{}", Theme::info("The cache is empty"));
        return;
    }

    println!("\n{}", Theme::header("Cached Artifacts"));
    println!(
        "{:<32} {:>10} {:<9} {:>10} {:>17}",
        "COMPONENT".dimmed(),
        "VERSION".dimmed(),
        "KIND".dimmed(),
        "SIZE".dimmed(),
        "LAST USED".dimmed()
    );
    println!("{}", Theme::separator());

    let mut total: u64 = 0;
    for entry in &entries {
        total = total.saturating_add(entry.size_bytes);
        println!(
            "{:<32} {:>10} {:<9} {:>10} {:>17}",
            entry.key.component_id,
            entry.key.version,
            entry.kind,
            Theme::bytes(entry.size_bytes),
            Theme::timestamp(&entry.last_used)
        );
    }

    println!(
        "\n{}",
        Theme::dimmed(&format!(
            "{} artifacts, {} of {}",
            entries.len(),
            Theme::bytes(total),
            Theme::bytes(manager.config().cache.max_size_bytes)
        ))
    );
    println!();
}

/// Evict least-recently-used artifacts until the cache fits its limit.
pub(crate) fn evict_cache(manager: &ComponentManager) -> anyhow::Result<()> {
    let evicted = manager.evict_cache()?;
    report_removed(&evicted, "Cache already within its size limit");
    Ok(())
}

/// Remove every cached artifact.
pub(crate) fn clear_cache(manager: &ComponentManager) -> anyhow::Result<()> {
    let removed = manager.clear_cache()?;
    report_removed(&removed, "Nothing to remove");
    Ok(())
}

/// Remove a single artifact.
pub(crate) fn remove_cached(
    manager: &ComponentManager,
    component: &str,
    version: &str,
    target: Option<&str>,
) -> anyhow::Result<()> {
    let key = CacheKey::new(
        parse_component(component)?,
        parse_version(version)?,
        target.map_or_else(Target::host, Target::new),
    );
    if manager.remove_cached(&key)? {
        println!("{}", Theme::success(&format!("Removed {key}")));
    } else {
        println!("{}", Theme::warning(&format!("{key} is not cached")));
    }
    Ok(())
}

fn report_removed(keys: &[CacheKey], nothing: &str) {
    if keys.is_empty() {
        println!("{}", Theme::info(nothing));
        return;
    }
    for key in keys {
        println!("  {} {key}", "-".red());
    }
    println!(
        "{}",
        Theme::success(&format!("Removed {} cached artifacts", keys.len()))
    );
}
