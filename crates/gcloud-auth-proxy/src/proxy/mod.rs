//! Proxy transports that forward requests after injecting an ID token.
//!
//! ```text
//! reverse:  client ── GET /idtoken/proxy/v1/x ──▶ proxy ── GET {upstream}/v1/x ──▶ upstream
//! forward:  client ── GET http://host/v1/x ─────▶ proxy ── GET http://host/v1/x ──▶ host
//!           client ── CONNECT host:443 ─────────▶ proxy (TLS terminated with a leaf
//!                                                  cert from the proxy CA) ──▶ https://host
//! ```
//!
//! Both strategies implement [`ProxyTransport`]; the server is generic over
//! it and the binary picks one from configuration.

pub mod forward;
pub mod mitm;
pub mod reverse;
pub mod upstream;

use std::future::Future;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::error::CredentialError;

pub use forward::ForwardProxy;
pub use mitm::{CertificateAuthority, MitmError};
pub use reverse::ReverseProxy;
pub use upstream::Upstream;

/// Path the proxy entry point is mounted on.
pub const PROXY_PATH: &str = "/idtoken/proxy";

/// Accept a request and produce either the upstream's response or a locally
/// synthesized error.
pub trait ProxyTransport: Send + Sync + 'static {
    /// Whether `req` must skip routing entirely and go straight to
    /// [`handle`](Self::handle). Forward proxies claim CONNECT and
    /// absolute-form requests this way.
    fn intercepts(&self, _req: &Request) -> bool {
        false
    }

    fn handle(&self, req: Request) -> impl Future<Output = Response> + Send;
}

/// Errors a transport turns into a local response instead of forwarding.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{0}")]
    Credential(#[from] CredentialError),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("invalid proxy target: {0}")]
    InvalidTarget(String),

    #[error("failed to read request body: {0}")]
    ReadBody(String),

    #[error("This is a proxy server. Does not respond to non-proxy requests.")]
    NotProxyRequest,
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Credential(_) | Self::NotProxyRequest => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::InvalidTarget(_) | Self::ReadBody(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();

        match &self {
            Self::Credential(e) => {
                error!(audience = %e.audience(), phase = e.phase(), error = %self, "Proxy refused to forward")
            }
            Self::NotProxyRequest => debug!("Non-proxy request reached the forward proxy"),
            _ => warn!(error = %self, "Proxy error"),
        }

        let mut resp = Response::new(Body::from(self.to_string()));
        *resp.status_mut() = status;
        resp.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        resp
    }
}
