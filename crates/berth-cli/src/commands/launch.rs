//! Launch command: start an app's components and keep them up until Ctrl-C.

use std::path::Path;

use anyhow::Context;
use berth_components::{AppManifest, ComponentManager, LaunchedApp};
use colored::Colorize;
use tracing::info;

use super::parse_scope;
use crate::theme::Theme;

/// Launch the app described by the manifest at `path`.
pub(crate) async fn launch(
    manager: &ComponentManager,
    path: &Path,
    scope: Option<&str>,
) -> anyhow::Result<()> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    let manifest = AppManifest::from_bytes(&bytes)?;
    let scope = parse_scope(scope, manager)?;

    println!(
        "{}",
        Theme::info(&format!("Launching {} {} ({scope})", manifest.name, manifest.version))
    );
    let app = manager.launch(&manifest, Some(scope)).await?;
    print_app(&app);

    println!("{}", Theme::dimmed("Press Ctrl-C to stop."));
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    info!(app_id = %app.app_id, "Closing app");
    manager.close_app(&app).await;
    manager.shutdown().await;
    println!("{}", Theme::success(&format!("Stopped {}", app.app_id)));
    Ok(())
}

fn print_app(app: &LaunchedApp) {
    println!("\n{}", Theme::header(&app.app_id));
    println!(
        "{:>10} {:<32} {:>10} {:>8} {}",
        "INSTANCE".dimmed(),
        "COMPONENT".dimmed(),
        "VERSION".dimmed(),
        "PID".dimmed(),
        "ENDPOINT".dimmed()
    );
    println!("{}", Theme::separator());

    for backend in &app.backends {
        let pid = backend
            .pid
            .map_or_else(|| "-".to_string(), |pid| pid.to_string());
        println!(
            "{:>10} {:<32} {:>10} {:>8} {} {}",
            Theme::short_id(&backend.instance_id.to_string()),
            backend.component_id,
            backend.version,
            pid,
            backend.endpoint,
            Theme::state(backend.state)
        );
    }
    for frontend in &app.frontends {
        println!(
            "{:>10} {:<32} {:>10} {:>8} {}",
            "-".dimmed(),
            frontend.key.component_id,
            frontend.key.version,
            "-",
            frontend.path.display()
        );
    }
    println!();
}
