//! Component identity types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Maximum accepted length for a component id or user scope.
const MAX_ID_LEN: usize = 256;

/// Stable identifier of a component across all of its versions.
///
/// Ids are opaque strings (often a content-network URI such as
/// `ant://...`). They must be non-empty, free of control characters and
/// surrounding whitespace. Use [`ComponentId::fs_name`] wherever the id has
/// to become a path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(String);

/// Error returned for an invalid [`ComponentId`] or [`Scope`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComponentIdError {
    /// The id was empty.
    #[error("identifier cannot be empty")]
    Empty,
    /// The id exceeded [`MAX_ID_LEN`] bytes.
    #[error("identifier is longer than {MAX_ID_LEN} bytes")]
    TooLong,
    /// Control characters or leading/trailing whitespace.
    #[error("identifier '{0}' contains control characters or surrounding whitespace")]
    InvalidCharacters(String),
    /// A user scope that is not a plain path segment.
    #[error("user scope '{0}' must use only letters, digits, '.', '_', '-', '@' and not start with '.'")]
    InvalidScope(String),
    /// The user scope collides with the shared bucket.
    #[error("'shared' is reserved and cannot be used as a user scope")]
    ReservedScope,
}

impl ComponentId {
    /// Create a validated component id.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is empty, too long, or contains control
    /// characters or surrounding whitespace.
    pub fn new(id: impl Into<String>) -> Result<Self, ComponentIdError> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Create from a string literal known to be valid.
    ///
    /// Invalid input is replaced with `"invalid-component"` in release builds
    /// and panics in debug builds; intended for tests and constants.
    #[must_use]
    pub fn from_static(id: &'static str) -> Self {
        debug_assert!(Self::validate(id).is_ok(), "invalid component id: {id}");
        if Self::validate(id).is_ok() {
            Self(id.to_string())
        } else {
            Self("invalid-component".to_string())
        }
    }

    fn validate(id: &str) -> Result<(), ComponentIdError> {
        if id.is_empty() {
            return Err(ComponentIdError::Empty);
        }
        if id.len() > MAX_ID_LEN {
            return Err(ComponentIdError::TooLong);
        }
        if id.chars().any(char::is_control) || id.trim() != id {
            return Err(ComponentIdError::InvalidCharacters(id.to_string()));
        }
        Ok(())
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A deterministic, filesystem-safe rendering of this id.
    ///
    /// Ids made only of `[A-Za-z0-9._-]` (not starting with `.`) are used
    /// verbatim. Anything else is sanitised and suffixed with a short blake3
    /// digest of the original id so distinct ids never share a directory.
    #[must_use]
    pub fn fs_name(&self) -> String {
        if is_plain_segment(&self.0) {
            return self.0.clone();
        }
        let sanitized: String = self
            .0
            .chars()
            .map(|c| if is_plain_char(c) { c } else { '_' })
            .collect();
        let sanitized = sanitized.trim_start_matches(['.', '_']);
        let digest = blake3::hash(self.0.as_bytes()).to_hex().to_string();
        let prefix: String = sanitized.chars().take(64).collect();
        if prefix.is_empty() {
            format!("id-{}", &digest[..16])
        } else {
            format!("{prefix}-{}", &digest[..16])
        }
    }
}

fn is_plain_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

fn is_plain_segment(s: &str) -> bool {
    !s.is_empty() && !s.starts_with('.') && s.chars().all(is_plain_char)
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ComponentId {
    type Err = ComponentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ComponentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for ComponentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ComponentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

/// Whether a component renders UI or runs as a service process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    /// A UI bundle shipped as a gzip tarball and extracted on fetch.
    Frontend,
    /// A native executable started as a supervised process.
    Backend,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frontend => f.write_str("frontend"),
            Self::Backend => f.write_str("backend"),
        }
    }
}

/// Build target an artifact was produced for.
///
/// Backends use `<arch>-<os>` (e.g. `x86_64-linux`); frontends use a platform
/// name. The special target `any` matches every host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Target(String);

impl Target {
    /// The wildcard target.
    pub const ANY: &'static str = "any";

    /// Create a target from a string.
    #[must_use]
    pub fn new(target: impl Into<String>) -> Self {
        Self(target.into())
    }

    /// The wildcard target.
    #[must_use]
    pub fn any() -> Self {
        Self(Self::ANY.to_string())
    }

    /// The target of the running host.
    #[must_use]
    pub fn host() -> Self {
        Self(format!(
            "{}-{}",
            std::env::consts::ARCH,
            std::env::consts::OS
        ))
    }

    /// Whether an artifact built for `self` can serve a request for `wanted`.
    #[must_use]
    pub fn satisfies(&self, wanted: &Self) -> bool {
        self.0 == Self::ANY || wanted.0 == Self::ANY || self.0 == wanted.0
    }

    /// The target as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Owner of a component's persistent data: one user, or the shared bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    /// Data visible to every user of the host.
    Shared,
    /// Data private to one user.
    User(String),
}

impl Scope {
    /// Literal used for the shared bucket.
    pub const SHARED: &'static str = "shared";

    /// A user scope.
    ///
    /// # Errors
    ///
    /// Returns an error if `user` cannot be used as a single path segment or
    /// collides with the shared bucket.
    pub fn user(user: impl Into<String>) -> Result<Self, ComponentIdError> {
        let user = user.into();
        if user.is_empty() {
            return Err(ComponentIdError::Empty);
        }
        if user.len() > MAX_ID_LEN {
            return Err(ComponentIdError::TooLong);
        }
        if user == Self::SHARED {
            return Err(ComponentIdError::ReservedScope);
        }
        let valid = !user.starts_with('.')
            && user
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '@'));
        if !valid {
            return Err(ComponentIdError::InvalidScope(user));
        }
        Ok(Self::User(user))
    }

    /// The directory segment for this scope.
    #[must_use]
    pub fn as_segment(&self) -> &str {
        match self {
            Self::Shared => Self::SHARED,
            Self::User(user) => user,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_segment())
    }
}

impl FromStr for Scope {
    type Err = ComponentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == Self::SHARED {
            Ok(Self::Shared)
        } else {
            Self::user(s)
        }
    }
}

impl Serialize for Scope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_segment())
    }
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
