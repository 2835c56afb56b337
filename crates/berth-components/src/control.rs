//! Control channel to running components.
//!
//! A backend announces a `tcp://host:port` endpoint on start. Status and stop
//! calls go to that endpoint as one JSON line each way:
//!
//! ```text
//! -> {"method":"status"}
//! <- {"ok":true,"state":"running","version":"1.2.3"}
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use berth_core::Version;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

use crate::error::{ComponentError, ComponentResult};

/// Longest reply line accepted from a component.
const MAX_REPLY_BYTES: u64 = 64 * 1024;

/// Address a component listens on for control calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ControlEndpoint {
    host: String,
    port: u16,
}

impl ControlEndpoint {
    /// Parse an announcement line such as `tcp://127.0.0.1:4100`.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::Control`] for anything that is not a
    /// `tcp://` URL with a host and port.
    pub fn parse(line: &str) -> ComponentResult<Self> {
        let line = line.trim();
        let invalid = |message: &str| ComponentError::Control {
            endpoint: line.to_string(),
            message: message.to_string(),
        };
        let url = Url::parse(line).map_err(|e| invalid(&e.to_string()))?;
        if url.scheme() != "tcp" {
            return Err(invalid("endpoint must use the tcp scheme"));
        }
        let host = url
            .host_str()
            .ok_or_else(|| invalid("endpoint has no host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port().ok_or_else(|| invalid("endpoint has no port"))?;
        Ok(Self { host, port })
    }

    /// Host name or address.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ControlEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "tcp://[{}]:{}", self.host, self.port)
        } else {
            write!(f, "tcp://{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ControlEndpoint {
    type Err = ComponentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ControlEndpoint {
    type Error = ComponentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ControlEndpoint> for String {
    fn from(endpoint: ControlEndpoint) -> Self {
        endpoint.to_string()
    }
}

/// A control call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum ControlRequest {
    /// Report state and version.
    Status,
    /// Shut down cleanly.
    Stop,
}

impl ControlRequest {
    fn name(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Stop => "stop",
        }
    }
}

/// A component's reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    /// Whether the call succeeded.
    pub ok: bool,
    /// Self-reported state, e.g. `running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Self-reported version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Failure detail when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Parsed status reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentStatus {
    /// Self-reported state.
    pub state: String,
    /// Self-reported version, if it parsed.
    pub version: Option<Version>,
}

/// Transport for status and stop calls.
#[async_trait]
pub trait ControlClient: Send + Sync {
    /// Query a component's status.
    async fn status(&self, endpoint: &ControlEndpoint) -> ComponentResult<ComponentStatus>;

    /// Ask a component to shut down. Returns once the request is acknowledged,
    /// not once the process has exited.
    async fn stop(&self, endpoint: &ControlEndpoint) -> ComponentResult<()>;
}

/// JSON-lines over TCP.
#[derive(Debug, Clone)]
pub struct TcpControlClient {
    timeout: Duration,
}

impl TcpControlClient {
    /// A client bounding each call by `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn call(
        &self,
        endpoint: &ControlEndpoint,
        request: ControlRequest,
    ) -> ComponentResult<ControlResponse> {
        let exchange = async {
            let control = |message: String| ComponentError::Control {
                endpoint: endpoint.to_string(),
                message,
            };
            let stream = TcpStream::connect((endpoint.host(), endpoint.port()))
                .await
                .map_err(|e| control(format!("connect failed: {e}")))?;
            let (read, mut write) = stream.into_split();

            let mut line = serde_json::to_vec(&request)
                .map_err(|e| control(format!("failed to encode request: {e}")))?;
            line.push(b'\n');
            write
                .write_all(&line)
                .await
                .map_err(|e| control(format!("write failed: {e}")))?;
            write
                .flush()
                .await
                .map_err(|e| control(format!("write failed: {e}")))?;

            let mut reply = String::new();
            let mut reader = BufReader::new(tokio::io::AsyncReadExt::take(read, MAX_REPLY_BYTES));
            let n = reader
                .read_line(&mut reply)
                .await
                .map_err(|e| control(format!("read failed: {e}")))?;
            if n == 0 {
                return Err(control("connection closed without a reply".into()));
            }
            serde_json::from_str::<ControlResponse>(reply.trim())
                .map_err(|e| control(format!("malformed reply: {e}")))
        };

        let response = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ComponentError::Timeout {
                operation: format!("{} call to {endpoint}", request.name()),
                after: self.timeout,
            })??;

        if !response.ok {
            return Err(ComponentError::Control {
                endpoint: endpoint.to_string(),
                message: response
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("{} call refused", request.name())),
            });
        }
        debug!(%endpoint, method = request.name(), "Control call succeeded");
        Ok(response)
    }
}

#[async_trait]
impl ControlClient for TcpControlClient {
    async fn status(&self, endpoint: &ControlEndpoint) -> ComponentResult<ComponentStatus> {
        let response = self.call(endpoint, ControlRequest::Status).await?;
        Ok(ComponentStatus {
            state: response.state.unwrap_or_else(|| "unknown".to_string()),
            version: response.version.as_deref().and_then(|v| Version::parse(v).ok()),
        })
    }

    async fn stop(&self, endpoint: &ControlEndpoint) -> ComponentResult<()> {
        self.call(endpoint, ControlRequest::Stop).await.map(|_| ())
    }
}
