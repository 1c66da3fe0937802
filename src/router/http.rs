//! HTTP seam used by the session router.

use std::time::Duration;

use tracing::{debug, warn};

use crate::{Result, VcsError};

/// Status, headers and body of one HTTP exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self { status: 200, headers: Vec::new(), body: body.into() }
    }

    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(key, _)| key.eq_ignore_ascii_case(name)).map(|(_, value)| value.as_str())
    }
}

/// Performs the router's HTTP requests.
///
/// Implementations report transport failures as errors. Any response that arrives,
/// whatever its status, is returned as `Ok`.
#[async_trait::async_trait]
pub trait HttpTransport: Send + Sync {
    async fn post(&self, url: &str, headers: &[(String, String)], body: String) -> Result<HttpResponse>;

    async fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse>;
}

/// [`HttpTransport`] on `reqwest` with rustls.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(connect_timeout: Duration, accept_invalid_certs: bool) -> Result<Self> {
        if accept_invalid_certs {
            warn!("Routing requests accept invalid certificates");
        }
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| VcsError::connection_failed_with_source("cannot build HTTP client", Box::new(e)))?;
        Ok(Self { client })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<HttpResponse> {
        let response = request
            .send()
            .await
            .map_err(|e| VcsError::connection_failed_with_source("HTTP request failed", Box::new(e)))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| VcsError::connection_failed_with_source("HTTP body read failed", Box::new(e)))?;
        debug!(status, len = body.len(), "HTTP response");
        Ok(HttpResponse { status, headers, body })
    }
}

#[async_trait::async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post(&self, url: &str, headers: &[(String, String)], body: String) -> Result<HttpResponse> {
        let mut request = self.client.post(url).body(body);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        self.send(request).await
    }

    async fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        self.send(request).await
    }
}
