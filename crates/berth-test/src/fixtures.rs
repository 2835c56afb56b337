//! Test fixtures: scratch homes and artifact bytes.

use std::path::Path;

use berth_core::{BerthHome, ComponentId};
use flate2::Compression;
use flate2::write::GzEncoder;
use tempfile::TempDir;

/// A Berth home in a temporary directory, removed on drop.
#[derive(Debug)]
pub struct TestHome {
    dir: TempDir,
    home: BerthHome,
}

impl TestHome {
    /// Create and lay out a fresh home.
    ///
    /// # Panics
    ///
    /// Panics if the temporary directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temporary home");
        let home = BerthHome::from_path(dir.path());
        home.ensure().expect("lay out temporary home");
        Self { dir, home }
    }

    /// The home layout.
    #[must_use]
    pub fn home(&self) -> &BerthHome {
        &self.home
    }

    /// Root of the temporary directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl Default for TestHome {
    fn default() -> Self {
        Self::new()
    }
}

/// A component id for tests.
#[must_use]
pub fn test_component(name: &'static str) -> ComponentId {
    ComponentId::from_static(name)
}

/// A gzip tarball holding `files` as `(path, contents)` pairs.
///
/// # Panics
///
/// Panics if the archive cannot be written.
#[must_use]
pub fn frontend_bundle(files: &[(&str, &str)]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, contents.as_bytes())
            .expect("append tar entry");
    }
    builder
        .into_inner()
        .and_then(GzEncoder::finish)
        .expect("finish tarball")
}

/// A gzip tarball with a single symlink entry, which extraction must refuse.
///
/// # Panics
///
/// Panics if the archive cannot be written.
#[must_use]
pub fn symlink_bundle(name: &str, target: &str) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Symlink);
    header.set_size(0);
    header.set_mode(0o777);
    builder
        .append_link(&mut header, name, target)
        .expect("append symlink entry");
    builder
        .into_inner()
        .and_then(GzEncoder::finish)
        .expect("finish tarball")
}

/// A POSIX shell script that behaves like a well-mannered component: it
/// announces `endpoint` and then runs `body`.
#[must_use]
pub fn backend_script(endpoint: &str, body: &str) -> Vec<u8> {
    format!("#!/bin/sh\necho '{endpoint}'\n{body}\n").into_bytes()
}

/// The `blake3:<hex>` integrity string of `bytes`.
#[must_use]
pub fn blake3_integrity(bytes: &[u8]) -> String {
    format!("blake3:{}", blake3::hash(bytes).to_hex())
}
