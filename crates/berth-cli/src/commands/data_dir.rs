//! Data-dir command.

use berth_components::ComponentManager;

use super::{parse_component, parse_scope, parse_version};

/// Print the data directory of a component version. The path is printed
/// bare so scripts can use it.
pub(crate) fn show_data_dir(
    manager: &ComponentManager,
    component: &str,
    version: &str,
    scope: Option<&str>,
) -> anyhow::Result<()> {
    let component = parse_component(component)?;
    let version = parse_version(version)?;
    let scope = parse_scope(scope, manager)?;
    println!(
        "{}",
        manager.data_dir(&scope, &component, &version).display()
    );
    Ok(())
}
