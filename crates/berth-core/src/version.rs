//! Concrete component versions.
//!
//! A [`Version`] is a plain `major.minor.patch` triple. Pre-release and build
//! metadata are not part of the component versioning scheme.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Semantic version of a published component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version {
    /// Major version - breaking changes
    pub major: u32,
    /// Minor version - new features, backwards compatible
    pub minor: u32,
    /// Patch version - bug fixes, backwards compatible
    pub patch: u32,
}

/// The line of releases a version is interchangeable with.
///
/// Leading zeros are treated as breaking: `1.x.y` releases share a line per
/// major, `0.y.z` per minor, and every `0.0.z` release is its own line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompatLine {
    /// `major >= 1`.
    Major(u32),
    /// `0.minor.*` with `minor >= 1`.
    Minor(u32),
    /// `0.0.patch`.
    Patch(u32),
}

impl Version {
    /// Creates a new version.
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a version from a string like "1.2.3".
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not in "major.minor.patch" format.
    pub fn parse(s: &str) -> Result<Self, VersionParseError> {
        s.parse()
    }

    /// The compatibility line this version belongs to.
    #[must_use]
    pub const fn compat_line(&self) -> CompatLine {
        if self.major > 0 {
            CompatLine::Major(self.major)
        } else if self.minor > 0 {
            CompatLine::Minor(self.minor)
        } else {
            CompatLine::Patch(self.patch)
        }
    }

    /// Whether `other` can replace `self` without a breaking change.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        self.compat_line() == other.compat_line()
    }

    /// The `(major, minor)` pair used to key persistent data.
    #[must_use]
    pub const fn major_minor(&self) -> (u32, u32) {
        (self.major, self.minor)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Error returned when parsing a version string fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionParseError {
    /// Wrong number of segments (expected "major.minor.patch").
    #[error("invalid version format: {0} (expected major.minor.patch)")]
    InvalidFormat(String),
    /// A numeric segment could not be parsed.
    #[error("invalid version number: {0}")]
    InvalidNumber(#[from] ParseIntError),
}

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parts: Vec<&str> = trimmed.split('.').collect();
        if parts.len() != 3 || parts.iter().any(|p| !is_numeric_segment(p)) {
            return Err(VersionParseError::InvalidFormat(s.to_string()));
        }
        Ok(Self {
            major: parts[0].parse()?,
            minor: parts[1].parse()?,
            patch: parts[2].parse()?,
        })
    }
}

/// Digits only. `u32::from_str` alone would accept a leading `+`.
pub(crate) fn is_numeric_segment(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering() {
        let mut versions = vec![
            Version::new(1, 10, 0),
            Version::new(1, 2, 9),
            Version::new(0, 9, 9),
            Version::new(2, 0, 0),
        ];
        versions.sort();
        assert_eq!(
            versions,
            vec![
                Version::new(0, 9, 9),
                Version::new(1, 2, 9),
                Version::new(1, 10, 0),
                Version::new(2, 0, 0),
            ]
        );
    }

    #[test]
    fn compat_lines_treat_leading_zeros_as_breaking() {
        assert_eq!(Version::new(1, 2, 3).compat_line(), CompatLine::Major(1));
        assert_eq!(Version::new(0, 2, 3).compat_line(), CompatLine::Minor(2));
        assert_eq!(Version::new(0, 0, 3).compat_line(), CompatLine::Patch(3));

        assert!(Version::new(1, 2, 5).is_compatible_with(&Version::new(1, 3, 0)));
        assert!(!Version::new(1, 9, 0).is_compatible_with(&Version::new(2, 0, 0)));
        assert!(Version::new(0, 2, 1).is_compatible_with(&Version::new(0, 2, 7)));
        assert!(!Version::new(0, 2, 1).is_compatible_with(&Version::new(0, 3, 0)));
        assert!(!Version::new(0, 0, 3).is_compatible_with(&Version::new(0, 0, 4)));
    }

    #[test]
    fn version_parse_valid() {
        let v = Version::parse("1.2.3").unwrap();
        assert_eq!(v, Version::new(1, 2, 3));

        let v: Version = "0.1.0".parse().unwrap();
        assert_eq!(v, Version::new(0, 1, 0));

        let v = Version::parse("  10.20.30  ").unwrap();
        assert_eq!(v, Version::new(10, 20, 30));
    }

    #[test]
    fn version_parse_invalid() {
        assert!(Version::parse("1.2").is_err());
        assert!(Version::parse("1.2.3.4").is_err());
        assert!(Version::parse("abc").is_err());
        assert!(Version::parse("1.two.3").is_err());
        assert!(Version::parse("1.+2.3").is_err());
        assert!(Version::parse("").is_err());
        assert!(matches!(
            Version::parse("1.2.99999999999"),
            Err(VersionParseError::InvalidNumber(_))
        ));
    }

    #[test]
    fn serializes_as_string() {
        let json = serde_json::to_string(&Version::new(1, 4, 2)).unwrap();
        assert_eq!(json, "\"1.4.2\"");
        let back: Version = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Version::new(1, 4, 2));
        assert!(serde_json::from_str::<Version>("\"1.4\"").is_err());
    }
}
