//! Upstream request forwarding
//!
//! Sends the (already rewritten) request to the backend and streams the
//! response back unchanged apart from hop-by-hop headers.

use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode};
use axum::response::Response;
use async_trait::async_trait;
use futures::TryStreamExt;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};

/// Default upstream request timeout
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(300);

/// Scheme of the listener that accepted a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerScheme {
    /// Plain HTTP listener
    Http,
    /// TLS listener
    Https,
}

impl ListenerScheme {
    /// URL scheme
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerScheme::Http => "http",
            ListenerScheme::Https => "https",
        }
    }
}

/// Where proxied requests go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamTarget {
    /// Fixed base URL; the request path is appended to its path
    Static(Url),
    /// Inbound `Host` header, reached over the accepting listener's scheme
    FromHost,
}

/// Forwarder settings
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Upstream target
    pub target: UpstreamTarget,
    /// Extra PEM roots trusted for upstream TLS
    pub ca_bundle_pem: Option<Vec<u8>>,
    /// Skip upstream certificate verification
    pub insecure_skip_verify: bool,
    /// Whole-request timeout
    pub timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            target: UpstreamTarget::FromHost,
            ca_bundle_pem: None,
            insecure_skip_verify: false,
            timeout: DEFAULT_UPSTREAM_TIMEOUT,
        }
    }
}

/// One outbound request
#[derive(Debug)]
pub struct UpstreamRequest {
    /// Method
    pub method: Method,
    /// Request path
    pub path: String,
    /// Encoded query string, without `?`
    pub query: Option<String>,
    /// Inbound headers; hop-by-hop headers are dropped on send
    pub headers: HeaderMap,
    /// Buffered body
    pub body: Bytes,
    /// Accepting listener
    pub scheme: ListenerScheme,
}

/// Sends constrained requests to the backend
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Send `request` and relay the response
    async fn forward(&self, request: UpstreamRequest) -> Result<Response<Body>>;
}

/// HTTP client bound to an upstream target
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    target: UpstreamTarget,
}

impl Forwarder {
    /// Build a forwarder with its own client
    pub fn new(config: ForwarderConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.insecure_skip_verify);

        if let Some(pem) = &config.ca_bundle_pem {
            let certs = reqwest::Certificate::from_pem_bundle(pem)
                .map_err(|e| Error::Config(format!("invalid upstream CA bundle: {}", e)))?;
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }

        let client = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to build upstream client: {}", e)))?;

        Ok(Self {
            client,
            target: config.target,
        })
    }

    /// Forwarder using an existing client
    pub fn with_client(client: reqwest::Client, target: UpstreamTarget) -> Self {
        Self { client, target }
    }

    /// Upstream target
    pub fn target(&self) -> &UpstreamTarget {
        &self.target
    }

    /// Resolve the upstream URL for a request
    pub fn url_for(
        &self,
        scheme: ListenerScheme,
        headers: &HeaderMap,
        path: &str,
        query: Option<&str>,
    ) -> Result<Url> {
        let mut url = match &self.target {
            UpstreamTarget::Static(base) => {
                let mut url = base.clone();
                let joined = format!("{}{}", base.path().trim_end_matches('/'), path);
                url.set_path(&joined);
                url
            }
            UpstreamTarget::FromHost => {
                let host = headers
                    .get(header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| Error::BadRequest("missing Host header".into()))?;
                Url::parse(&format!("{}://{}{}", scheme.as_str(), host, path))
                    .map_err(|e| Error::BadRequest(format!("invalid upstream host: {}", e)))?
            }
        };
        url.set_query(query.filter(|q| !q.is_empty()));
        Ok(url)
    }
}

#[async_trait]
impl Upstream for Forwarder {
    async fn forward(&self, request: UpstreamRequest) -> Result<Response<Body>> {
        let url = self.url_for(
            request.scheme,
            &request.headers,
            &request.path,
            request.query.as_deref(),
        )?;

        debug!(method = %request.method, url = %url, "Forwarding upstream");

        let mut builder = self.client.request(request.method, url);
        for (name, value) in request.headers.iter() {
            if is_hop_by_hop(name) || name == header::HOST || name == header::CONTENT_LENGTH {
                continue;
            }
            builder = builder.header(name, value);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let upstream = builder
            .send()
            .await
            .map_err(|e| Error::Proxy(format!("upstream request failed: {}", e)))?;

        relay(upstream)
    }
}

/// Stream an upstream response back to the caller
fn relay(upstream: reqwest::Response) -> Result<Response<Body>> {
    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut response = Response::builder().status(status);
    for (name, value) in upstream.headers() {
        if is_hop_by_hop(name) || name == header::CONTENT_LENGTH {
            continue;
        }
        response = response.header(name, value);
    }

    let stream = upstream.bytes_stream().map_err(std::io::Error::other);
    response
        .body(Body::from_stream(stream))
        .map_err(|e| Error::Internal(format!("failed to build response: {}", e)))
}

/// Connection-scoped headers that must not cross the proxy
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}
