//! Reverse proxy: everything under `/idtoken/proxy` goes to one upstream.

use axum::extract::Request;
use axum::http::Uri;
use axum::response::{IntoResponse, Response};
use tracing::debug;
use uuid::Uuid;

use super::{PROXY_PATH, ProxyError, ProxyTransport, Upstream};
use crate::inject::Injector;
use crate::token::TokenSourceFactory;

pub struct ReverseProxy<F: TokenSourceFactory> {
    injector: Injector<F>,
    upstream: Upstream,
    base: reqwest::Url,
}

impl<F: TokenSourceFactory> ReverseProxy<F> {
    pub fn new(injector: Injector<F>, upstream: Upstream, base: reqwest::Url) -> Self {
        Self {
            injector,
            upstream,
            base,
        }
    }

    /// `{base}{path after /idtoken/proxy}?{query}`.
    pub fn target_url(&self, uri: &Uri) -> Result<reqwest::Url, ProxyError> {
        let rest = uri.path().strip_prefix(PROXY_PATH).unwrap_or(uri.path());
        if !rest.is_empty() && !rest.starts_with('/') {
            // e.g. /idtoken/proxyfoo
            return Err(ProxyError::InvalidTarget(uri.path().to_string()));
        }
        // `set_path` would resolve these and leave the base path.
        if rest.split(['/', '\\']).any(is_dot_segment) {
            return Err(ProxyError::InvalidTarget(uri.path().to_string()));
        }

        let mut url = self.base.clone();
        let path = format!("{}{}", self.base.path().trim_end_matches('/'), rest);
        url.set_path(if path.is_empty() { "/" } else { &path });
        url.set_query(uri.query());
        Ok(url)
    }

    async fn proxy(&self, mut req: Request) -> Result<Response, ProxyError> {
        let request_id = Uuid::new_v4();
        let target = self.target_url(req.uri())?;
        debug!(%request_id, method = %req.method(), %target, "Reverse proxying request");

        self.injector.inject(&mut req, "").await?;

        let resp = self.upstream.forward(req, target).await?;
        debug!(%request_id, status = resp.status().as_u16(), "Upstream responded");
        Ok(resp)
    }
}

fn is_dot_segment(segment: &str) -> bool {
    matches!(
        segment.to_ascii_lowercase().as_str(),
        "." | ".." | "%2e" | "%2e%2e" | ".%2e" | "%2e."
    )
}

impl<F: TokenSourceFactory> ProxyTransport for ReverseProxy<F> {
    async fn handle(&self, req: Request) -> Response {
        self.proxy(req).await.unwrap_or_else(IntoResponse::into_response)
    }
}
