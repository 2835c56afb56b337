//! Override command: pin a component to a specific version.

use berth_components::{Actor, ComponentManager, OverrideOutcome, OverrideStatus};
use colored::Colorize;

use super::{parse_component, parse_version};
use crate::theme::Theme;

fn actor(user: Option<&str>) -> Actor {
    user.map_or_else(Actor::current, Actor::new)
}

/// Record a version pin.
pub(crate) fn request_override(
    manager: &ComponentManager,
    component: &str,
    version: &str,
    user: Option<&str>,
) -> anyhow::Result<()> {
    let component = parse_component(component)?;
    let version = parse_version(version)?;

    match manager.request_override(&component, version, &actor(user))? {
        OverrideOutcome::RestartRequired => {
            println!(
                "{}",
                Theme::success(&format!("{component} will run {version} after a restart"))
            );
            println!(
                "{}",
                Theme::info("Run `berth override activate` to restart now.")
            );
        },
        OverrideOutcome::AdminRestartRequired => {
            println!(
                "{}",
                Theme::success(&format!("{component} pinned to {version}"))
            );
            println!(
                "{}",
                Theme::info("Clients pick the pin up when the shared host is restarted.")
            );
        },
        OverrideOutcome::ContactAdministrator { message } => {
            println!("{}", Theme::warning(&message));
        },
    }
    Ok(())
}

/// Restart the host's components so pending pins take effect.
pub(crate) async fn activate_overrides(
    manager: &ComponentManager,
    user: Option<&str>,
) -> anyhow::Result<()> {
    let activated = manager.restart_host(&actor(user)).await?;
    if activated.is_empty() {
        println!("{}", Theme::info("No pending overrides"));
        return Ok(());
    }
    for pin in &activated {
        println!(
            "{}",
            Theme::success(&format!("{} now runs {}", pin.component_id, pin.version))
        );
    }
    Ok(())
}

/// Drop the pin for a component.
pub(crate) fn clear_override(
    manager: &ComponentManager,
    component: &str,
    user: Option<&str>,
) -> anyhow::Result<()> {
    let component = parse_component(component)?;
    if manager.clear_override(&component, &actor(user))? {
        println!("{}", Theme::success(&format!("Cleared override for {component}")));
    } else {
        println!("{}", Theme::info(&format!("{component} is not pinned")));
    }
    Ok(())
}

/// List every pin.
pub(crate) fn list_overrides(manager: &ComponentManager) -> anyhow::Result<()> {
    let pins = manager.overrides()?;
    if pins.is_empty() {
        println!("{}", Theme::info("No version overrides"));
        return Ok(());
    }

    println!("\n{}", Theme::header("Version Overrides"));
    println!(
        "{:<32} {:>10} {:<8} {:<12} {}",
        "COMPONENT".dimmed(),
        "VERSION".dimmed(),
        "STATUS".dimmed(),
        "BY".dimmed(),
        "REQUESTED".dimmed()
    );
    println!("{}", Theme::separator());
    for pin in pins {
        let status = match pin.status {
            OverrideStatus::Pending => "pending".yellow(),
            OverrideStatus::Active => "active".green(),
        };
        println!(
            "{:<32} {:>10} {:<8} {:<12} {}",
            pin.component_id,
            pin.version,
            status,
            pin.requested_by,
            Theme::timestamp(&pin.requested_at)
        );
    }
    println!();
    Ok(())
}
