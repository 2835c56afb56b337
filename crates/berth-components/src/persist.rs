//! Lock-guarded TOML state files.
//!
//! The cache index and the version-override file are both small TOML
//! documents shared between every Berth process on the host. Reads take a
//! shared advisory lock on a `.lk` sibling, writes take an exclusive one and
//! replace the file atomically.

use std::io::Write;
use std::path::Path;

use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{ComponentError, ComponentResult};

/// A TOML document with a schema version.
pub(crate) trait StateFile: Serialize + DeserializeOwned + Default {
    /// Schema version this build writes.
    const SCHEMA_VERSION: u32;
    /// Short name for log messages.
    const KIND: &'static str;

    /// Schema version found on disk.
    fn schema_version(&self) -> u32;
}

fn state_error(path: &Path, message: String) -> ComponentError {
    ComponentError::Cache {
        path: path.to_path_buf(),
        message,
    }
}

/// Load `path`, treating a missing file as the default document.
pub(crate) fn load_or_default<T: StateFile>(path: &Path) -> ComponentResult<T> {
    let _lock_guard = acquire_lock_file(path, LockMode::Shared)?;

    match std::fs::read_to_string(path) {
        Ok(content) => parse_content(path, &content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(state_error(
            path,
            format!("failed to read {}: {e}", T::KIND),
        )),
    }
}

fn parse_content<T: StateFile>(path: &Path, content: &str) -> ComponentResult<T> {
    let state: T = toml::from_str(content)
        .map_err(|e| state_error(path, format!("failed to parse {}: {e}", T::KIND)))?;

    if state.schema_version() != T::SCHEMA_VERSION {
        warn!(
            path = %path.display(),
            found = state.schema_version(),
            expected = T::SCHEMA_VERSION,
            "{} schema version mismatch, attempting best-effort load",
            T::KIND
        );
    }
    Ok(state)
}

/// Load, mutate, and save `path` under a single exclusive lock.
///
/// Returns the saved document and whatever the closure returned.
pub(crate) fn update<T, R, F>(path: &Path, f: F) -> ComponentResult<(T, R)>
where
    T: StateFile,
    F: FnOnce(&mut T) -> ComponentResult<R>,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| state_error(path, format!("failed to create parent directory: {e}")))?;
    }

    let _lock_guard = acquire_lock_file(path, LockMode::Exclusive)?;

    let mut state: T = match std::fs::read_to_string(path) {
        Ok(content) => parse_content(path, &content)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => T::default(),
        Err(e) => {
            return Err(state_error(
                path,
                format!("failed to read {}: {e}", T::KIND),
            ));
        },
    };

    let out = f(&mut state)?;
    save_inner(path, &state)?;
    Ok((state, out))
}

/// Caller must hold the exclusive lock.
fn save_inner<T: StateFile>(path: &Path, state: &T) -> ComponentResult<()> {
    let header = "# Auto-generated by berth. Do not edit manually.\n\n";
    let body = toml::to_string_pretty(state)
        .map_err(|e| state_error(path, format!("failed to serialize {}: {e}", T::KIND)))?;
    let content = format!("{header}{body}");

    let parent = path.parent().unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| state_error(path, format!("failed to create temp file: {e}")))?;
    tmp.write_all(content.as_bytes())
        .map_err(|e| state_error(path, format!("failed to write temp file: {e}")))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| state_error(path, format!("failed to sync temp file: {e}")))?;
    tmp.persist(path)
        .map_err(|e| state_error(path, format!("failed to replace {}: {e}", T::KIND)))?;

    debug!(path = %path.display(), "Saved {}", T::KIND);
    Ok(())
}

#[derive(Clone, Copy)]
enum LockMode {
    Shared,
    Exclusive,
}

/// Advisory lock on a `.lk` sibling of `path`. Dropping the file releases it.
///
/// A shared lock on a path that has never been written returns `None`: with
/// no lock file there is no writer to coordinate with.
fn acquire_lock_file(path: &Path, mode: LockMode) -> ComponentResult<Option<std::fs::File>> {
    let lock_path = path.with_extension("lk");

    match mode {
        LockMode::Shared => match std::fs::OpenOptions::new().read(true).open(&lock_path) {
            Ok(lock_file) => {
                lock_file.lock_shared().map_err(|e| {
                    state_error(path, format!("failed to acquire shared file lock: {e}"))
                })?;
                Ok(Some(lock_file))
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(state_error(path, format!("failed to open lock file: {e}"))),
        },
        LockMode::Exclusive => {
            let lock_file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .read(true)
                .open(&lock_path)
                .map_err(|e| state_error(path, format!("failed to open lock file: {e}")))?;
            lock_file.lock_exclusive().map_err(|e| {
                state_error(path, format!("failed to acquire exclusive file lock: {e}"))
            })?;
            Ok(Some(lock_file))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Counter {
        schema_version: u32,
        value: u32,
    }

    impl StateFile for Counter {
        const SCHEMA_VERSION: u32 = 1;
        const KIND: &'static str = "counter";

        fn schema_version(&self) -> u32 {
            self.schema_version
        }
    }

    #[test]
    fn missing_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let state: Counter = load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(state, Counter::default());
        assert!(!dir.path().join("absent.lk").exists());
    }

    #[test]
    fn update_persists_and_returns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("counter.toml");

        let (state, previous) = update(&path, |c: &mut Counter| {
            let previous = c.value;
            c.schema_version = 1;
            c.value = 7;
            Ok(previous)
        })
        .unwrap();
        assert_eq!(previous, 0);
        assert_eq!(state.value, 7);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("# Auto-generated by berth"));
        let reloaded: Counter = load_or_default(&path).unwrap();
        assert_eq!(reloaded.value, 7);
    }

    #[test]
    fn failed_update_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counter.toml");
        update(&path, |c: &mut Counter| {
            c.value = 1;
            Ok(())
        })
        .unwrap();

        let result = update(&path, |c: &mut Counter| -> ComponentResult<()> {
            c.value = 99;
            Err(ComponentError::Extraction {
                message: "boom".into(),
            })
        });
        assert!(result.is_err());
        let reloaded: Counter = load_or_default(&path).unwrap();
        assert_eq!(reloaded.value, 1);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counter.toml");
        std::fs::write(&path, "value = [").unwrap();
        assert!(load_or_default::<Counter>(&path).is_err());
    }
}
