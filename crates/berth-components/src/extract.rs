//! Safe extraction of frontend bundles.
//!
//! Frontend artifacts are gzip-compressed tarballs unpacked into the cache.
//! Extraction refuses:
//! - Path traversal (`../` components) and absolute paths
//! - Symlinks, hardlinks, and device entries
//! - Archives with too many entries or too many uncompressed bytes

use std::path::{Component, Path};

use flate2::read::GzDecoder;
use tar::Archive;

use crate::error::{ComponentError, ComponentResult};

/// Maximum number of entries allowed in a bundle.
const MAX_ENTRY_COUNT: usize = 10_000;

/// Maximum total extracted size (500 MB).
const MAX_EXTRACTED_SIZE: u64 = 500_000_000;

/// Extract `data` into the existing directory `dest`.
///
/// Returns the total size in bytes declared by the archive entries.
///
/// # Errors
///
/// Returns [`ComponentError::Extraction`] for decompression failures, empty
/// archives and exceeded limits, [`ComponentError::PathTraversal`] for
/// escaping paths, and [`ComponentError::UnsafeEntryType`] for links and
/// devices.
pub fn extract_bundle(data: &[u8], dest: &Path) -> ComponentResult<u64> {
    let mut archive = Archive::new(GzDecoder::new(data));
    archive.set_preserve_permissions(false);

    let dest = dest.canonicalize().map_err(|e| extraction(format!(
        "failed to canonicalize destination: {e}"
    )))?;

    let mut entry_count = 0usize;
    let mut total_size: u64 = 0;

    for entry_result in archive
        .entries()
        .map_err(|e| extraction(format!("failed to read archive entries: {e}")))?
    {
        let mut entry =
            entry_result.map_err(|e| extraction(format!("failed to read archive entry: {e}")))?;

        entry_count = entry_count.saturating_add(1);
        if entry_count > MAX_ENTRY_COUNT {
            return Err(extraction(format!(
                "archive exceeds maximum entry count ({MAX_ENTRY_COUNT})"
            )));
        }

        let entry_type = entry.header().entry_type();
        if !is_safe_entry_type(entry_type) {
            let entry_path = entry
                .path()
                .map_or_else(|_| "<unknown>".to_string(), |p| p.display().to_string());
            return Err(ComponentError::UnsafeEntryType {
                entry_type: format!("{entry_type:?}"),
                path: entry_path,
            });
        }

        let entry_size = entry
            .header()
            .size()
            .map_err(|e| extraction(format!("failed to read entry size: {e}")))?;
        total_size = total_size.saturating_add(entry_size);
        if total_size > MAX_EXTRACTED_SIZE {
            return Err(extraction(format!(
                "archive exceeds maximum extracted size ({MAX_EXTRACTED_SIZE} bytes)"
            )));
        }

        let entry_path = entry
            .path()
            .map_err(|e| extraction(format!("failed to read entry path: {e}")))?
            .into_owned();
        validate_entry_path(&entry_path)?;

        let target = dest.join(&entry_path);
        if let Some(canonical_parent) = target.parent().and_then(|p| p.canonicalize().ok()) {
            let canonical_target = canonical_parent.join(target.file_name().unwrap_or_default());
            if !canonical_target.starts_with(&dest) {
                return Err(ComponentError::PathTraversal {
                    path: entry_path.display().to_string(),
                });
            }
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                extraction(format!("failed to create directory {}: {e}", parent.display()))
            })?;
        }

        entry
            .unpack(&target)
            .map_err(|e| extraction(format!("failed to unpack {}: {e}", entry_path.display())))?;
    }

    if entry_count == 0 {
        return Err(extraction("archive is empty".into()));
    }

    Ok(total_size)
}

fn extraction(message: String) -> ComponentError {
    ComponentError::Extraction { message }
}

/// Regular files, directories, and metadata headers only.
fn is_safe_entry_type(entry_type: tar::EntryType) -> bool {
    matches!(
        entry_type,
        tar::EntryType::Regular
            | tar::EntryType::Directory
            | tar::EntryType::GNULongName
            | tar::EntryType::XHeader
            | tar::EntryType::XGlobalHeader
    )
}

fn validate_entry_path(path: &Path) -> ComponentResult<()> {
    let escapes = path.is_absolute()
        || path.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::Prefix(_) | Component::RootDir
            )
        });
    if escapes {
        return Err(ComponentError::PathTraversal {
            path: path.display().to_string(),
        });
    }
    Ok(())
}
