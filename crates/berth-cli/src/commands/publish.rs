//! Publish command: add a release to the local content store.

use std::path::{Path, PathBuf};

use anyhow::Context;
use berth_components::{ComponentManager, DirectoryStore, NewArtifact, publish};
use berth_core::{ComponentKind, Target};
use flate2::Compression;
use flate2::write::GzEncoder;

use super::{KindArg, parse_component, parse_version};
use crate::theme::Theme;

/// Publish `artifact` as `component` at `version`.
///
/// A directory is packed into a gzip tarball first, which is what frontend
/// bundles are expected to be.
pub(crate) async fn publish_release(
    manager: &ComponentManager,
    component: &str,
    version: &str,
    artifact: &Path,
    kind: KindArg,
    target: Option<&str>,
) -> anyhow::Result<()> {
    let component = parse_component(component)?;
    let version = parse_version(version)?;
    let kind = ComponentKind::from(kind);
    let target = target.map_or_else(
        || match kind {
            ComponentKind::Backend => Target::host(),
            ComponentKind::Frontend => Target::any(),
        },
        Target::new,
    );

    let bytes = if artifact.is_dir() {
        pack_directory(artifact)?
    } else {
        std::fs::read(artifact)
            .with_context(|| format!("failed to read artifact {}", artifact.display()))?
    };

    let root = store_root(manager);
    if manager.config().network.gateway_url.is_some() {
        println!(
            "{}",
            Theme::warning("The gateway is read-only; publishing to the local store instead.")
        );
    }
    let store = DirectoryStore::new(&root);
    let entry = publish(
        &store,
        &component,
        version,
        kind,
        vec![NewArtifact {
            target: target.clone(),
            bytes,
        }],
    )
    .await?;

    println!(
        "{}",
        Theme::success(&format!("Published {component} {version} ({target})"))
    );
    println!("{}", Theme::kv("Entry", entry.as_str()));
    println!("{}", Theme::kv("Store", &root.display().to_string()));
    println!();
    Ok(())
}

fn store_root(manager: &ComponentManager) -> PathBuf {
    manager
        .config()
        .network
        .store_dir
        .as_ref()
        .map_or_else(|| manager.home().store_dir(), PathBuf::from)
}

/// Pack the contents of `dir` into a gzip tarball.
fn pack_directory(dir: &Path) -> anyhow::Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", dir)
        .with_context(|| format!("failed to pack {}", dir.display()))?;
    let encoder = builder.into_inner().context("failed to finish tarball")?;
    encoder.finish().context("failed to compress tarball")
}
