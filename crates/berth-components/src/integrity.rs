//! Artifact integrity hashes.
//!
//! Release manifests declare one hash per artifact, either as a native
//! `blake3:<hex>` digest (the content network's own addressing hash) or as an
//! SRI string (`sha512-<base64>` / `sha256-<base64>`) for artifacts hosted on
//! plain HTTPS. SHA-1 is rejected.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;

/// A declared content hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Integrity {
    /// 32-byte blake3 digest.
    Blake3([u8; 32]),
    /// SRI hash. Multiple tokens are reduced to the strongest on parse.
    Sri {
        /// Hash algorithm.
        algorithm: SriAlgorithm,
        /// Raw digest bytes.
        digest: Vec<u8>,
    },
}

/// Supported SRI hash algorithms, ordered by strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SriAlgorithm {
    /// SHA-256.
    Sha256,
    /// SHA-512.
    Sha512,
}

/// Error returned when an integrity string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid integrity '{input}': {message}")]
pub struct IntegrityParseError {
    /// The rejected string.
    pub input: String,
    /// What was wrong with it.
    pub message: String,
}

impl Integrity {
    /// The blake3 integrity of `data`.
    #[must_use]
    pub fn blake3(data: &[u8]) -> Self {
        Self::Blake3(*blake3::hash(data).as_bytes())
    }

    /// Hash `data` with the same algorithm as `self`.
    #[must_use]
    pub fn compute_like(&self, data: &[u8]) -> Self {
        match self {
            Self::Blake3(_) => Self::blake3(data),
            Self::Sri { algorithm, .. } => Self::Sri {
                algorithm: *algorithm,
                digest: compute_sri(*algorithm, data),
            },
        }
    }

    /// Whether `data` hashes to this value. Constant-time comparison.
    #[must_use]
    pub fn matches(&self, data: &[u8]) -> bool {
        match (self, &self.compute_like(data)) {
            (Self::Blake3(expected), Self::Blake3(actual)) => {
                bool::from(actual.as_slice().ct_eq(expected.as_slice()))
            },
            (Self::Sri { digest: expected, .. }, Self::Sri { digest: actual, .. }) => {
                bool::from(actual.as_slice().ct_eq(expected.as_slice()))
            },
            _ => false,
        }
    }
}

fn compute_sri(algorithm: SriAlgorithm, data: &[u8]) -> Vec<u8> {
    match algorithm {
        SriAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        SriAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
    }
}

impl fmt::Display for Integrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blake3(digest) => write!(f, "blake3:{}", hex::encode(digest)),
            Self::Sri { algorithm, digest } => {
                let prefix = match algorithm {
                    SriAlgorithm::Sha256 => "sha256",
                    SriAlgorithm::Sha512 => "sha512",
                };
                let b64 = base64::engine::general_purpose::STANDARD.encode(digest);
                write!(f, "{prefix}-{b64}")
            },
        }
    }
}

impl FromStr for Integrity {
    type Err = IntegrityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fail = |message: String| IntegrityParseError {
            input: s.to_string(),
            message,
        };
        let trimmed = s.trim();

        if let Some(hex_digest) = trimmed.strip_prefix("blake3:") {
            let bytes = hex::decode(hex_digest).map_err(|e| fail(e.to_string()))?;
            let digest: [u8; 32] = bytes
                .try_into()
                .map_err(|_| fail("blake3 digest must be 32 bytes".to_string()))?;
            return Ok(Self::Blake3(digest));
        }

        // SRI can contain multiple space-separated hashes. Use the strongest.
        let mut best: Option<(SriAlgorithm, &str)> = None;
        for token in trimmed.split_whitespace() {
            let token = token.split('?').next().unwrap_or(token);
            let parsed = if let Some(hash) = token.strip_prefix("sha512-") {
                Some((SriAlgorithm::Sha512, hash))
            } else if let Some(hash) = token.strip_prefix("sha256-") {
                Some((SriAlgorithm::Sha256, hash))
            } else if token.starts_with("sha1-") {
                None
            } else {
                return Err(fail(format!("unsupported algorithm in '{token}'")));
            };
            if let Some((algo, hash)) = parsed
                && best.as_ref().is_none_or(|(current, _)| algo > *current)
            {
                best = Some((algo, hash));
            }
        }

        let (algorithm, encoded) = best.ok_or_else(|| fail("no usable hash".to_string()))?;
        let digest = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| fail(format!("invalid base64: {e}")))?;
        Ok(Self::Sri { algorithm, digest })
    }
}

impl serde::Serialize for Integrity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Integrity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
