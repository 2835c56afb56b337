//! Config command: show the effective configuration.

use anyhow::Context;
use berth_config::ResolvedConfig;
use berth_core::BerthHome;

use crate::theme::Theme;

/// Print the merged configuration as TOML or JSON.
pub(crate) fn show_config(
    resolved: &ResolvedConfig,
    format: &str,
    sources: bool,
) -> anyhow::Result<()> {
    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&resolved.config)
                .context("failed to render configuration as JSON")?;
            println!("{json}");
        },
        "toml" => print!("{}", resolved.to_toml_string()?),
        other => anyhow::bail!("unknown format '{other}' (expected toml or json)"),
    }

    if sources {
        println!("\n{}", Theme::header("Sources"));
        for line in resolved.annotated_sources() {
            println!("  {}", Theme::dimmed(&line));
        }
    }
    Ok(())
}

/// Print the files that were checked and which of them were loaded.
pub(crate) fn show_paths(resolved: &ResolvedConfig) -> anyhow::Result<()> {
    let home = BerthHome::resolve().context("failed to locate the berth home")?;

    println!("\n{}", Theme::header("Configuration Files"));
    println!("{}", Theme::kv("System", "/etc/berth/config.toml"));
    println!("{}", Theme::kv("User", &home.config_path().display().to_string()));
    println!();
    if resolved.loaded_files.is_empty() {
        println!("{}", Theme::info("No files loaded; using built-in defaults"));
    } else {
        println!("{}", Theme::header("Loaded"));
        for file in &resolved.loaded_files {
            println!("  {}", Theme::success(file));
        }
    }
    println!();
    Ok(())
}
