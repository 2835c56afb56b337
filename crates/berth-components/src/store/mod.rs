//! Content-addressed storage.
//!
//! The content network is modelled as a key/value store of immutable objects
//! addressed by the blake3 hash of their bytes, plus one mutable pointer per
//! component naming the newest history entry. Implementations must verify
//! that returned bytes hash to the requested address.

mod directory;
#[cfg(feature = "http")]
mod http;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use berth_core::ComponentId;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ComponentError, ComponentResult};

pub use directory::DirectoryStore;
#[cfg(feature = "http")]
pub use http::HttpStore;

/// Lowercase hex blake3 digest identifying an immutable object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentAddress(String);

impl ContentAddress {
    /// The address of `bytes`.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).to_hex().to_string())
    }

    /// The address as a hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check that `bytes` hash to this address.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::Store`] when they do not.
    pub fn verify(&self, bytes: &[u8]) -> ComponentResult<()> {
        let actual = Self::of(bytes);
        if actual == *self {
            Ok(())
        } else {
            Err(ComponentError::Store {
                address: self.0.clone(),
                message: format!("content hashes to {actual}"),
            })
        }
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentAddress {
    type Err = ComponentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit());
        if valid {
            Ok(Self(s.to_ascii_lowercase()))
        } else {
            Err(ComponentError::Store {
                address: s.to_string(),
                message: "not a 64-character hex blake3 address".to_string(),
            })
        }
    }
}

impl Serialize for ContentAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ContentAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Read access to the content network.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Fetch the object at `address`. The bytes are verified against it.
    async fn get(&self, address: &ContentAddress) -> ComponentResult<Vec<u8>>;

    /// Address of the newest history entry for `component`, if it was ever
    /// published.
    async fn latest(&self, component: &ComponentId) -> ComponentResult<Option<ContentAddress>>;
}

/// A store that accepts new objects. Used for publishing.
#[async_trait]
pub trait WritableStore: ContentStore {
    /// Store `bytes` and return their address.
    async fn put(&self, bytes: &[u8]) -> ComponentResult<ContentAddress>;

    /// Point `component`'s history at a new head entry.
    async fn set_latest(&self, component: &ComponentId, entry: &ContentAddress)
    -> ComponentResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_of_is_stable_hex() {
        let a = ContentAddress::of(b"hello");
        assert_eq!(a.as_str().len(), 64);
        assert_eq!(a, ContentAddress::of(b"hello"));
        assert_ne!(a, ContentAddress::of(b"hello!"));
    }

    #[test]
    fn verify_detects_tampering() {
        let a = ContentAddress::of(b"hello");
        assert!(a.verify(b"hello").is_ok());
        assert!(matches!(
            a.verify(b"jello"),
            Err(ComponentError::Store { .. })
        ));
    }

    #[test]
    fn parse_normalises_case() {
        let a = ContentAddress::of(b"x");
        let upper: ContentAddress = a.as_str().to_ascii_uppercase().parse().unwrap();
        assert_eq!(upper, a);
        assert!("abc".parse::<ContentAddress>().is_err());
    }
}
