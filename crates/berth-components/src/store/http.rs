//! Content store reached through an HTTPS gateway.
//!
//! The gateway serves `GET <base>/objects/<address>` and
//! `GET <base>/pointers/<component-id>`; a 404 on a pointer means the
//! component was never published.

use std::time::Duration;

use async_trait::async_trait;
use berth_core::ComponentId;
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use super::{ContentAddress, ContentStore};
use crate::download::download_with_limit;
use crate::error::{ComponentError, ComponentResult};

/// Pointers are a single address; anything larger is not a pointer.
const MAX_POINTER_BYTES: u64 = 1024;

/// Read-only content store behind an HTTPS gateway.
#[derive(Debug, Clone)]
pub struct HttpStore {
    base: Url,
    client: reqwest::Client,
    max_object_bytes: u64,
}

impl HttpStore {
    /// Create a store for the gateway at `base`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(base: Url, request_timeout: Duration, max_object_bytes: u64) -> ComponentResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("berth/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ComponentError::Store {
                address: base.to_string(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            base,
            client,
            max_object_bytes,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> ComponentResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| ComponentError::Store {
                address: self.base.to_string(),
                message: "gateway URL cannot be a base".to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn fetch(&self, url: Url, limit: u64) -> ComponentResult<Option<Vec<u8>>> {
        let address = url.to_string();
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ComponentError::Store {
                address: address.clone(),
                message: e.to_string(),
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => download_with_limit(response, limit).await.map(Some),
            status => Err(ComponentError::Store {
                address,
                message: format!("gateway returned {status}"),
            }),
        }
    }
}

#[async_trait]
impl ContentStore for HttpStore {
    async fn get(&self, address: &ContentAddress) -> ComponentResult<Vec<u8>> {
        let url = self.endpoint(&["objects", address.as_str()])?;
        let bytes = self
            .fetch(url, self.max_object_bytes)
            .await?
            .ok_or_else(|| ComponentError::Store {
                address: address.to_string(),
                message: "object not found".to_string(),
            })?;
        address.verify(&bytes)?;
        debug!(%address, size = bytes.len(), "Fetched object from gateway");
        Ok(bytes)
    }

    async fn latest(&self, component: &ComponentId) -> ComponentResult<Option<ContentAddress>> {
        let url = self.endpoint(&["pointers", component.as_str()])?;
        match self.fetch(url, MAX_POINTER_BYTES).await? {
            Some(bytes) => String::from_utf8_lossy(&bytes).trim().parse().map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_escape_component_ids() {
        let store = HttpStore::new(
            Url::parse("https://gateway.example.org/v1/").unwrap(),
            Duration::from_secs(5),
            1024,
        )
        .unwrap();
        let url = store.endpoint(&["pointers", "ant://notes/backend"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://gateway.example.org/v1/pointers/ant:%2F%2Fnotes%2Fbackend"
        );
    }
}
