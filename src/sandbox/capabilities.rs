/// Host capabilities handed to widget scripts
///
/// Scripts get exactly what is installed here and nothing else. HTTP access is
/// optional and goes through [`HttpCapability`] so tests and embedders can swap
/// the transport.

use crate::sandbox::error::HostError;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

/// Blocking HTTP access for scripts
///
/// Called from the worker thread running the interpreter, never from an
/// async context.
pub trait HttpCapability: Send + Sync {
    fn get(&self, url: &str, headers: &[(String, String)]) -> Result<String, HostError>;
    fn post(&self, url: &str, headers: &[(String, String)], body: &str) -> Result<String, HostError>;
}

/// Capability set installed into every fresh interpreter
#[derive(Clone, Default)]
pub struct SandboxCapabilities {
    pub http: Option<Arc<dyn HttpCapability>>,
}

impl SandboxCapabilities {
    /// No network access: only json helpers, print and remote_error
    pub fn offline() -> Self {
        Self::default()
    }

    pub fn with_http(http: Arc<dyn HttpCapability>) -> Self {
        Self { http: Some(http) }
    }
}

impl std::fmt::Debug for SandboxCapabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxCapabilities")
            .field("http", &self.http.is_some())
            .finish()
    }
}

/// reqwest-backed HTTP capability
///
/// Drives the async client on the server runtime through a captured handle,
/// so blocking worker threads can use it without a runtime of their own.
#[derive(Debug, Clone)]
pub struct ReqwestHttp {
    client: reqwest::Client,
    handle: tokio::runtime::Handle,
}

impl ReqwestHttp {
    /// Must be called from within a tokio runtime
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| anyhow::anyhow!("HTTP capability needs a tokio runtime: {}", e))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("pulseboard/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, handle })
    }

    fn send(&self, request: reqwest::RequestBuilder, url: &str) -> Result<String, HostError> {
        self.handle.block_on(async {
            let response = request.send().await.map_err(|e| classify(e, url))?;
            let status = response.status();
            let text = response.text().await.map_err(|e| classify(e, url))?;

            if !status.is_success() {
                let message = if text.trim().is_empty() {
                    status.canonical_reason().unwrap_or("request rejected").to_string()
                } else {
                    text.trim().to_string()
                };
                return Err(HostError::RemoteService {
                    status: Some(status.as_u16()),
                    message: format!("{} returned {}: {}", url, status.as_u16(), message),
                });
            }

            tracing::debug!("📡 {} answered {} ({} bytes)", url, status, text.len());
            Ok(text)
        })
    }
}

impl HttpCapability for ReqwestHttp {
    fn get(&self, url: &str, headers: &[(String, String)]) -> Result<String, HostError> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        self.send(request, url)
    }

    fn post(&self, url: &str, headers: &[(String, String)], body: &str) -> Result<String, HostError> {
        let mut request = self.client.post(url).body(body.to_string());
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        self.send(request, url)
    }
}

/// Map a transport error onto the host error taxonomy
fn classify(error: reqwest::Error, url: &str) -> HostError {
    if error.is_timeout() {
        return HostError::Timeout(url.to_string());
    }

    // DNS failures only show up in the source chain text
    let mut source: Option<&(dyn StdError + 'static)> = error.source();
    while let Some(cause) = source {
        let text = cause.to_string().to_lowercase();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            let host = error
                .url()
                .and_then(|u| u.host_str())
                .unwrap_or(url)
                .to_string();
            return HostError::HostResolution(host);
        }
        source = cause.source();
    }

    HostError::Request(error.to_string())
}
