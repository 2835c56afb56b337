//! Where an artifact's bytes come from.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ComponentError, ComponentResult};
use crate::store::ContentAddress;

/// Artifact location as written in a release manifest.
///
/// Serialized as a URI string: `ant://<address>`, `https://...`, or
/// `file:///absolute/path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ArtifactSource {
    /// Immutable object in the content network.
    Network(ContentAddress),
    /// Plain HTTPS download. Must carry a declared integrity hash.
    Https(Url),
    /// Local file or directory. Development only; never hashed.
    LocalPath(PathBuf),
}

impl ArtifactSource {
    /// URI scheme for content-network objects.
    pub const NETWORK_SCHEME: &'static str = "ant";

    /// Parse a source URI.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::UnsupportedSource`] for unknown schemes,
    /// malformed addresses, and relative file paths.
    pub fn parse(uri: &str) -> ComponentResult<Self> {
        let unsupported = || ComponentError::UnsupportedSource {
            uri: uri.to_string(),
        };
        let trimmed = uri.trim();

        if let Some(address) = trimmed.strip_prefix("ant://") {
            let address = address.trim_end_matches('/');
            return address
                .parse::<ContentAddress>()
                .map(Self::Network)
                .map_err(|_| unsupported());
        }

        if trimmed.starts_with('/') {
            return Ok(Self::LocalPath(PathBuf::from(trimmed)));
        }

        let url = Url::parse(trimmed).map_err(|_| unsupported())?;
        match url.scheme() {
            "https" | "http" => Ok(Self::Https(url)),
            "file" => url
                .to_file_path()
                .map(Self::LocalPath)
                .map_err(|()| unsupported()),
            _ => Err(unsupported()),
        }
    }

    /// Whether fetching this source skips integrity hashing.
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, Self::LocalPath(_))
    }
}

impl fmt::Display for ArtifactSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(address) => write!(f, "ant://{address}"),
            Self::Https(url) => write!(f, "{url}"),
            Self::LocalPath(path) => write!(f, "file://{}", path.display()),
        }
    }
}

impl From<ArtifactSource> for String {
    fn from(source: ArtifactSource) -> Self {
        source.to_string()
    }
}

impl TryFrom<String> for ArtifactSource {
    type Error = ComponentError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_network_address() {
        let address = ContentAddress::of(b"artifact");
        let source = ArtifactSource::parse(&format!("ant://{address}")).unwrap();
        assert_eq!(source, ArtifactSource::Network(address.clone()));
        assert_eq!(source.to_string(), format!("ant://{address}"));
    }

    #[test]
    fn parses_https_and_file() {
        let https = ArtifactSource::parse("https://cdn.example.org/notes-1.2.0.tar.gz").unwrap();
        assert!(matches!(https, ArtifactSource::Https(_)));

        let file = ArtifactSource::parse("file:///home/dev/notes/target/debug/notes").unwrap();
        assert_eq!(
            file,
            ArtifactSource::LocalPath("/home/dev/notes/target/debug/notes".into())
        );
        assert!(file.is_local());

        let bare = ArtifactSource::parse("/opt/notes").unwrap();
        assert!(bare.is_local());
    }

    #[test]
    fn rejects_unknown_schemes() {
        assert!(ArtifactSource::parse("ftp://example.org/x").is_err());
        assert!(ArtifactSource::parse("ant://not-hex").is_err());
        assert!(ArtifactSource::parse("relative/path").is_err());
    }

    #[test]
    fn serde_uses_uri_strings() {
        let source = ArtifactSource::parse("https://cdn.example.org/a").unwrap();
        let json = serde_json::to_string(&source).unwrap();
        assert_eq!(json, "\"https://cdn.example.org/a\"");
        let back: ArtifactSource = serde_json::from_str(&json).unwrap();
        assert_eq!(back, source);
    }
}
