//! Outbound HTTP capability.
//!
//! The URL is parsed and its host checked against an exact-match,
//! case-insensitive allowlist before the transport is even consulted, so
//! a denied host never causes network I/O. The transport is injected
//! ([`HttpTransport`]) which keeps the policy testable without sockets.

use std::io::Read;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use super::{Allowlist, CapError};
use crate::manifest::Manifest;

/// User-Agent header sent with requests.
const USER_AGENT: &str = concat!("capsule-host/", env!("CARGO_PKG_VERSION"));

const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// `[http]` section of the host configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct HttpSettings {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_response_bytes() -> usize {
    5 * 1024 * 1024
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_response_bytes: default_max_response_bytes(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub hosts: Allowlist,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub max_response_bytes: usize,
}

impl HttpConfig {
    pub fn new(hosts: Allowlist, settings: &HttpSettings) -> Self {
        Self {
            hosts,
            timeout: Duration::from_secs(settings.timeout_secs),
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            max_response_bytes: settings.max_response_bytes,
        }
    }

    pub fn from_manifest(manifest: &Manifest, settings: &HttpSettings) -> Self {
        let hosts = if manifest.present {
            Allowlist::only_lowercase(manifest.hosts.iter().map(|h| normalize_host(h)))
        } else {
            Allowlist::Any
        };
        Self::new(hosts, settings)
    }
}

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: String,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Performs the actual network exchange for an already-authorized request.
///
/// Implementations must honour the timeouts and the response-size cap of
/// the config they are given.
pub trait HttpTransport {
    fn send(
        &self,
        request: &OutboundRequest,
        config: &HttpConfig,
    ) -> Result<OutboundResponse, CapError>;
}

/// Lowercases a host and strips IPv6 brackets and a trailing dot.
fn normalize_host(host: &str) -> String {
    host.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

/// Parses `url` and checks its host against the allowlist.
pub fn authorize(config: &HttpConfig, url: &str) -> Result<Url, CapError> {
    let parsed =
        Url::parse(url).map_err(|e| CapError::InvalidArgument(format!("invalid URL: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(CapError::InvalidArgument(format!(
                "unsupported scheme '{scheme}' (only http/https)"
            )))
        }
    }

    let host = parsed
        .host_str()
        .map(normalize_host)
        .ok_or_else(|| CapError::InvalidArgument(format!("URL has no host: {url}")))?;

    if !config.hosts.contains(&host) {
        return Err(CapError::Denied(format!("host '{host}' is not in the allowlist")));
    }
    Ok(parsed)
}

/// Sends an HTTP request on behalf of a script.
pub fn request(
    config: &HttpConfig,
    transport: &dyn HttpTransport,
    method: &str,
    url: &str,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
) -> Result<OutboundResponse, CapError> {
    let method = method.trim().to_ascii_uppercase();
    if !ALLOWED_METHODS.contains(&method.as_str()) {
        return Err(CapError::InvalidArgument(format!("unsupported method '{method}'")));
    }
    let url = authorize(config, url)?;

    debug!("http.request {method} {url}");
    transport.send(
        &OutboundRequest {
            method,
            url,
            headers,
            body,
        },
        config,
    )
}

// ── reqwest transport ───────────────────────────────────

/// Blocking `reqwest` transport. Redirects are never followed: the
/// redirect target has not been checked against the allowlist.
pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpConfig) -> Result<Self, CapError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| CapError::Io(format!("HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> CapError {
    if e.is_timeout() {
        CapError::Timeout(e.to_string())
    } else if e.is_builder() {
        CapError::InvalidArgument(e.to_string())
    } else {
        CapError::Io(e.to_string())
    }
}

impl HttpTransport for ReqwestTransport {
    fn send(
        &self,
        request: &OutboundRequest,
        config: &HttpConfig,
    ) -> Result<OutboundResponse, CapError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| CapError::InvalidArgument(format!("method: {e}")))?;

        let mut builder = self.client.request(method, request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().map_err(map_reqwest_error)?;
        let limit = config.max_response_bytes;

        if let Some(len) = response.content_length() {
            if len > limit as u64 {
                return Err(CapError::Io(format!(
                    "response too large ({len} bytes, limit is {limit} bytes)"
                )));
            }
        }

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();

        let mut body = Vec::new();
        response
            .take(limit as u64 + 1)
            .read_to_end(&mut body)
            .map_err(|e| CapError::from_io("reading response body", e))?;
        if body.len() > limit {
            warn!("Outbound response from {} exceeded {limit} bytes", request.url);
            return Err(CapError::Io(format!(
                "response too large (limit is {limit} bytes)"
            )));
        }

        Ok(OutboundResponse {
            status,
            headers,
            body,
        })
    }
}
