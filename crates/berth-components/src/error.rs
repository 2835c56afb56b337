//! Component lifecycle error types.

use std::path::PathBuf;
use std::time::Duration;

use berth_core::{ComponentId, RequirementParseError, Version};

/// Errors from resolving, fetching, and supervising components.
///
/// Every variant is `Clone` so a single in-flight start can hand the same
/// failure to each caller waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ComponentError {
    /// A version requirement string was malformed.
    #[error(transparent)]
    Parse(#[from] RequirementParseError),

    /// No known version satisfies the requirement.
    #[error("no version of {component} satisfies '{requirement}'")]
    NotFound {
        /// The component that was looked up.
        component: ComponentId,
        /// The requirement that could not be met.
        requirement: String,
    },

    /// The remote version history could not be read and nothing cached matches.
    #[error("version history for {component} is unreachable: {message}")]
    Unreachable {
        /// The component whose history was requested.
        component: ComponentId,
        /// Underlying failure.
        message: String,
    },

    /// Downloaded bytes do not hash to the declared value.
    #[error("integrity mismatch for {component} {version}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        /// The component being fetched.
        component: ComponentId,
        /// The version being fetched.
        version: Version,
        /// Declared hash.
        expected: String,
        /// Hash of the received bytes.
        actual: String,
    },

    /// A component process could not be brought to `Running`.
    #[error("failed to start {component} {version}: {reason}")]
    StartFailed {
        /// The component being started.
        component: ComponentId,
        /// The version being started.
        version: Version,
        /// Why the start failed.
        reason: String,
    },

    /// A component process exited without being asked to.
    #[error("{component} {version} exited unexpectedly: {exit}")]
    Crashed {
        /// The component that crashed.
        component: ComponentId,
        /// The version that crashed.
        version: Version,
        /// Exit status description.
        exit: String,
    },

    /// A version was requested that would share a data directory with a
    /// newer running version of the same line.
    #[error("{component} {requested} conflicts with running {running}: both use the v{line} data directory")]
    VersionConflict {
        /// The component.
        component: ComponentId,
        /// The version already running.
        running: Version,
        /// The older version that was requested.
        requested: Version,
        /// The shared `major.minor` line.
        line: String,
    },

    /// An operation exceeded its time budget.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// What was being attempted.
        operation: String,
        /// The budget that was exceeded.
        after: Duration,
    },

    /// An app or release manifest failed to parse or validate.
    #[error("invalid manifest: {message}")]
    InvalidManifest {
        /// What was wrong.
        message: String,
    },

    /// The content store rejected or could not serve an address.
    #[error("content store error for {address}: {message}")]
    Store {
        /// The address being read or written.
        address: String,
        /// Underlying failure.
        message: String,
    },

    /// The local artifact cache or its index failed.
    #[error("cache error at {path}: {message}")]
    Cache {
        /// The cache path involved.
        path: PathBuf,
        /// Underlying failure.
        message: String,
    },

    /// A frontend archive could not be extracted.
    #[error("extraction failed: {message}")]
    Extraction {
        /// Underlying failure.
        message: String,
    },

    /// An archive entry tried to escape the extraction directory.
    #[error("archive entry escapes the extraction directory: {path}")]
    PathTraversal {
        /// The offending entry path.
        path: String,
    },

    /// An archive contained a symlink, hardlink, or device entry.
    #[error("unsafe archive entry type {entry_type} at {path}")]
    UnsafeEntryType {
        /// The tar entry type.
        entry_type: String,
        /// The offending entry path.
        path: String,
    },

    /// A download exceeded the configured size limit.
    #[error("artifact too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge {
        /// Observed size.
        size: u64,
        /// Configured limit.
        limit: u64,
    },

    /// A filesystem operation failed.
    #[error("I/O error at {path}: {message}")]
    Io {
        /// The path involved.
        path: PathBuf,
        /// Underlying failure.
        message: String,
    },

    /// A status or stop call to a running component failed.
    #[error("control call to {endpoint} failed: {message}")]
    Control {
        /// The component endpoint.
        endpoint: String,
        /// Underlying failure.
        message: String,
    },

    /// A version override or host restart was refused.
    #[error("version override refused: {message}")]
    OverrideDenied {
        /// User-facing reason.
        message: String,
    },

    /// An artifact source scheme is not supported in this configuration.
    #[error("unsupported artifact source: {uri}")]
    UnsupportedSource {
        /// The rejected source.
        uri: String,
    },

    /// No running instance has this id.
    #[error("no running instance {0}")]
    UnknownInstance(String),
}

impl ComponentError {
    /// Wrap an I/O error with the path it occurred at.
    pub fn io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// A message suitable for showing to an end user.
    ///
    /// Internal detail such as hashes, paths, and raw exit statuses is left to
    /// the log.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Parse(err) => format!(
                "The version requirement '{}' is not valid ({}).",
                err.input, err.kind
            ),
            Self::NotFound {
                component,
                requirement,
            } => format!("No published version of {component} matches '{requirement}'."),
            Self::Unreachable { component, .. } => format!(
                "Could not reach the network to look up {component}. Check your connection and try again."
            ),
            Self::IntegrityMismatch {
                component, version, ..
            } => format!(
                "The download of {component} {version} was corrupted or tampered with and has been discarded."
            ),
            Self::StartFailed {
                component, version, ..
            } => format!("{component} {version} could not be started."),
            Self::Crashed {
                component, version, ..
            } => format!("{component} {version} stopped unexpectedly."),
            Self::VersionConflict {
                component,
                running,
                requested,
                ..
            } => format!(
                "{component} {running} is already running with the data {requested} would use. Stop it before starting {requested}."
            ),
            Self::Timeout { operation, .. } => {
                format!("{operation} took too long and was cancelled.")
            },
            Self::InvalidManifest { message } => {
                format!("The application manifest is invalid: {message}.")
            },
            Self::TooLarge { .. } => "A component download exceeded the allowed size.".to_string(),
            Self::OverrideDenied { message } => message.clone(),
            Self::UnsupportedSource { uri } => {
                format!("Components cannot be loaded from '{uri}' in this configuration.")
            },
            Self::UnknownInstance(_) => "That component is no longer running.".to_string(),
            Self::Store { .. }
            | Self::Cache { .. }
            | Self::Extraction { .. }
            | Self::PathTraversal { .. }
            | Self::UnsafeEntryType { .. }
            | Self::Io { .. }
            | Self::Control { .. } => {
                "An internal error occurred while managing components. See the log for details."
                    .to_string()
            },
        }
    }

    /// Whether retrying the same operation later could succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unreachable { .. }
                | Self::StartFailed { .. }
                | Self::Timeout { .. }
                | Self::Control { .. }
        )
    }
}

/// Result type for component operations.
pub type ComponentResult<T> = Result<T, ComponentError>;

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::VersionReq;

    #[test]
    fn parse_errors_convert() {
        let err: ComponentError = VersionReq::parse("^").unwrap_err().into();
        assert!(matches!(err, ComponentError::Parse(_)));
        assert!(err.user_message().contains("'^'"));
    }

    #[test]
    fn user_messages_hide_internals() {
        let err = ComponentError::IntegrityMismatch {
            component: ComponentId::from_static("com.example.notes"),
            version: Version::new(1, 2, 0),
            expected: "blake3:aaaa".into(),
            actual: "blake3:bbbb".into(),
        };
        let msg = err.user_message();
        assert!(msg.contains("com.example.notes 1.2.0"));
        assert!(!msg.contains("blake3"));

        let err = ComponentError::Io {
            path: "/var/lib/secret".into(),
            message: "permission denied".into(),
        };
        assert!(!err.user_message().contains("/var/lib/secret"));
    }

    #[test]
    fn transient_classification() {
        let unreachable = ComponentError::Unreachable {
            component: ComponentId::from_static("x"),
            message: "offline".into(),
        };
        assert!(unreachable.is_transient());
        let denied = ComponentError::OverrideDenied {
            message: "no".into(),
        };
        assert!(!denied.is_transient());
        let conflict = ComponentError::VersionConflict {
            component: ComponentId::from_static("x"),
            running: Version::new(1, 2, 9),
            requested: Version::new(1, 2, 5),
            line: "1.2".into(),
        };
        assert!(!conflict.is_transient());
        assert!(conflict.user_message().contains("Stop it"));
    }
}
