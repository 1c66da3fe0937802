//! Session router: resolves which VCS server serves a device.
//!
//! Three lookups are made against external services, each as one HTTP exchange run on
//! the engine runtime while the calling thread waits a bounded time:
//!
//! - public ip of the device, from the routing service (CSR)
//! - community id (so-code), from the referrer service
//! - the route itself, from the routing service, retried once on connection errors
//!
//! A request that outlives its wait is aborted and treated as an empty response.

pub mod http;
pub mod response;

use std::future::Future;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use chrono::Local;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, info, instrument, warn};

use crate::config::AppDescriptor;
use crate::error::ErrorCode;
use crate::types::ServerEndpoint;
use crate::{Result, VcsError};

pub use http::{HttpResponse, HttpTransport, ReqwestTransport};
pub use response::TokenCursor;

/// Application-level error status of the routing service.
pub const CSR_ERROR_STATUS: u16 = 590;
/// Referrer group used for community lookups.
pub const COMMUNITY_GROUP_ID: &str = "17";

const ROUTE_PATH: &str = "/CSRS/IFCSR_ROUTE_INFO.action";
const REMOTE_IP_PATH: &str = "/CSRS/IFCSR_REMOTE_IP.action";
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S%.3f";

/// Raw outcome of a route request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsrResult {
    /// Routing service result code, `0` on success.
    pub code: i32,
    pub message: String,
    pub ip: String,
    pub port: u16,
    pub session_id: String,
}

impl CsrResult {
    fn connection_error(message: impl Into<String>) -> Self {
        Self { code: ErrorCode::VCS_CONNECTION_ERROR.value(), message: message.into(), ..Self::default() }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

/// A resolved route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub endpoint: ServerEndpoint,
    pub session_id: String,
}

/// Client for the routing and referrer services.
pub struct CsrRouter {
    transport: Arc<dyn HttpTransport>,
    runtime: Handle,
    timeout: Duration,
}

impl CsrRouter {
    pub fn new(transport: Arc<dyn HttpTransport>, runtime: Handle, timeout: Duration) -> Self {
        Self { transport, runtime, timeout }
    }

    /// Fills in the descriptor's public ip and so-code as needed, then requests the route.
    ///
    /// Consumes the descriptor's clear-cache flag. Failures carry the routing code
    /// remapped into the CSR band.
    #[instrument(skip_all, fields(mac = %app.mac_address))]
    pub fn resolve(&self, app: &mut AppDescriptor) -> Result<Route> {
        if app.public_ip.as_deref().is_none_or(str::is_empty) {
            app.public_ip = self.request_public_ip(app);
        }

        if app.use_referrer && app.so_code.as_deref().is_none_or(str::is_empty) {
            match app.public_ip.clone() {
                Some(public_ip) => {
                    app.so_code = self.request_community_id(&app.referrer_address(), &public_ip, COMMUNITY_GROUP_ID);
                }
                None => warn!("No public ip, community lookup skipped"),
            }
        }

        let no_cache = std::mem::take(&mut app.clear_csr_cache);
        let mut result = self.request_route(app, no_cache);
        if result.code == ErrorCode::VCS_CONNECTION_ERROR.value() {
            info!("Route request failed, retrying once");
            result = self.request_route(app, false);
        }

        if !result.is_success() {
            let code = ErrorCode::from_csr(result.code);
            warn!(%code, message = %result.message, "Route request rejected");
            return Err(VcsError::Routing { code, reason: result.message });
        }

        let route = Route {
            endpoint: ServerEndpoint { ip: result.ip, port: result.port },
            session_id: result.session_id,
        };
        info!(endpoint = %route.endpoint, session_id = %route.session_id, "Route resolved");
        Ok(route)
    }

    /// Asks the routing service which server serves this device.
    pub fn request_route(&self, app: &AppDescriptor, no_cache: bool) -> CsrResult {
        let status = if no_cache { "NO-CACHE" } else { "INIT" };
        let body = format!(
            "<?xml version='1.0' encoding='utf-8' ?><CSROUTE><STB ID ='{{{}}}' STATUS='{}' APPID='{}' SVCID='{}' SOCODE='' /></CSROUTE>",
            app.mac_address, status, app.app_id, app.svc_id
        );
        let url = format!("{}{}", app.csr_url, ROUTE_PATH);
        info!(%url, "Route request");
        debug!(%body, "Route request body");

        match self.csr_post(url, csr_headers(app), body) {
            Some(text) => parse_route(&text),
            None => CsrResult::connection_error("no response from routing service"),
        }
    }

    /// Asks the routing service for the device's public address.
    pub fn request_public_ip(&self, app: &AppDescriptor) -> Option<String> {
        let body = format!(
            "<?xml version='1.0' encoding='utf-8' ?><CSROUTE><STB ID ='{{{}}}' STATUS='INIT' APPID='{}' SOCODE='{}' /></CSROUTE>",
            app.mac_address,
            app.app_id,
            app.so_code.as_deref().unwrap_or_default()
        );
        let url = format!("{}{}", app.csr_url, REMOTE_IP_PATH);
        info!(%url, "Public ip request");

        let text = self.csr_post(url, csr_headers(app), body)?;
        let public_ip = parse_public_ip(&text);
        debug!(?public_ip, "Public ip");
        public_ip
    }

    /// Looks up the community id for `remote_ip` on the referrer service.
    pub fn request_community_id(&self, referrer: &str, remote_ip: &str, group_id: &str) -> Option<String> {
        let url = format!("http://{}/referrer/v1.0/community?remoteIp={}&groupId={}", referrer, remote_ip, group_id);
        info!(%url, "Community id request");

        let transport = Arc::clone(&self.transport);
        let headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        let response = self.run_bounded(async move { transport.get(&url, &headers).await })?;
        if response.status != 200 {
            info!(status = response.status, "Community id request rejected");
            return None;
        }
        let community_id = parse_community_id(&response.body);
        debug!(?community_id, "Community id");
        community_id
    }

    /// POSTs to the routing service. Returns the body to parse, if any.
    fn csr_post(&self, url: String, headers: Vec<(String, String)>, body: String) -> Option<String> {
        let transport = Arc::clone(&self.transport);
        let response = self.run_bounded(async move { transport.post(&url, &headers, body).await })?;

        match response.status {
            200 => Some(response.body.trim().to_string()),
            CSR_ERROR_STATUS => {
                let result = response.header("result").unwrap_or_default();
                let reason = response.header("reason").unwrap_or_default();
                info!(status = response.status, %result, %reason, "Routing service error");
                Some(error_envelope(result, reason))
            }
            status => {
                info!(status, "Unexpected routing response status");
                None
            }
        }
    }

    /// Runs `request` on the engine runtime and waits at most the configured timeout.
    fn run_bounded<F, T>(&self, request: F) -> Option<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let task = self.runtime.spawn(async move {
            let _ = tx.send(request.await);
        });

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!(error = %e, "HTTP request failed");
                None
            }
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "HTTP request timed out");
                task.abort();
                None
            }
        }
    }
}

impl std::fmt::Debug for CsrRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsrRouter").field("timeout", &self.timeout).finish()
    }
}

fn csr_headers(app: &AppDescriptor) -> Vec<(String, String)> {
    vec![
        ("Content-Type".to_string(), "text/xml".to_string()),
        ("Client_ID".to_string(), app.svc_id.clone()),
        ("CLIENT_IP".to_string(), app.public_ip.clone().unwrap_or_default()),
        ("TimeStamp".to_string(), Local::now().format(TIMESTAMP_FORMAT).to_string()),
        ("Auth_Val".to_string(), app.auth_val.clone()),
        ("Api_Key".to_string(), app.api_key.clone()),
    ]
}

/// Rebuilds a 590 status as the regular result envelope.
fn error_envelope(result: &str, reason: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"no\"?><CSROUTE><Result Code=\"{}\" Message=\"{}\"/></CSROUTE>",
        result, reason
    )
}

/// Parses a route response. Empty or malformed responses are connection errors.
pub fn parse_route(text: &str) -> CsrResult {
    if text.is_empty() {
        return CsrResult::connection_error("empty routing response");
    }
    let mut cursor = TokenCursor::new(text);
    let parsed = (|| -> Result<CsrResult> {
        let code = cursor.int("Result Code=")?;
        let message = cursor.string("Message=")?.to_string();
        if code != 0 {
            return Ok(CsrResult { code, message, ..CsrResult::default() });
        }
        let ip = cursor.string("IP=")?.to_string();
        let port = cursor.int("Port=")?;
        let session_id = cursor.string("SessionID=")?.to_string();
        let port = u16::try_from(port)
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| VcsError::parse_error("routing response", format!("invalid port {}", port)))?;
        if ip.is_empty() {
            return Err(VcsError::parse_error("routing response", "empty server ip"));
        }
        Ok(CsrResult { code, message, ip, port, session_id })
    })();

    parsed.unwrap_or_else(|e| {
        warn!(error = %e, "Malformed routing response");
        CsrResult::connection_error(e.to_string())
    })
}

/// Public ip from a remote-ip response. Comma lists keep their first entry.
pub fn parse_public_ip(text: &str) -> Option<String> {
    let value = TokenCursor::new(text).string("STB IP=").ok()?;
    let first = value.split(',').next().unwrap_or_default().trim();
    (!first.is_empty()).then(|| first.to_string())
}

/// `communityId` from a referrer response, as a string.
pub fn parse_community_id(text: &str) -> Option<String> {
    let json: Value = serde_json::from_str(text.trim()).ok()?;
    match json.get("communityId")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}
