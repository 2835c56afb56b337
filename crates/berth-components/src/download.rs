//! Size-limited HTTP downloads.

use futures::StreamExt;

use crate::error::{ComponentError, ComponentResult};

/// Read a response body, failing once it grows past `max_size` bytes.
pub(crate) async fn download_with_limit(
    response: reqwest::Response,
    max_size: u64,
) -> ComponentResult<Vec<u8>> {
    let url = response.url().to_string();

    if let Some(declared) = response.content_length()
        && declared > max_size
    {
        return Err(ComponentError::TooLarge {
            size: declared,
            limit: max_size,
        });
    }

    let capacity =
        usize::try_from(response.content_length().unwrap_or(0).min(max_size)).unwrap_or(0);
    let mut bytes = Vec::with_capacity(capacity);
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ComponentError::Store {
            address: url.clone(),
            message: format!("download error: {e}"),
        })?;
        bytes.extend_from_slice(&chunk);
        let current_size = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
        if current_size > max_size {
            return Err(ComponentError::TooLarge {
                size: current_size,
                limit: max_size,
            });
        }
    }

    Ok(bytes)
}
