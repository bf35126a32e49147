//! Forward proxy: clients set `HTTP_PROXY`/`HTTPS_PROXY` to this server.
//!
//! Plain HTTP arrives in absolute form and is forwarded directly. HTTPS
//! arrives as CONNECT; the tunnel is answered with 200, TLS is terminated
//! with a leaf certificate from [`CertificateAuthority`], and each request
//! inside it is handled like a plain one against `https://{authority}`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{Method, Uri};
use axum::response::{IntoResponse, Response};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{CertificateAuthority, MitmError, ProxyError, ProxyTransport, Upstream};
use crate::inject::Injector;
use crate::token::TokenSourceFactory;

pub struct ForwardProxy<F: TokenSourceFactory> {
    injector: Injector<F>,
    upstream: Upstream,
    ca: Arc<CertificateAuthority>,
    verbose: bool,
}

impl<F: TokenSourceFactory> Clone for ForwardProxy<F> {
    fn clone(&self) -> Self {
        Self {
            injector: self.injector.clone(),
            upstream: self.upstream.clone(),
            ca: Arc::clone(&self.ca),
            verbose: self.verbose,
        }
    }
}

/// Absolute-form request target: `GET http://host/path HTTP/1.1`.
pub fn is_absolute_form(uri: &Uri) -> bool {
    uri.scheme().is_some() && uri.authority().is_some()
}

impl<F: TokenSourceFactory> ForwardProxy<F> {
    pub fn new(injector: Injector<F>, upstream: Upstream, ca: Arc<CertificateAuthority>, verbose: bool) -> Self {
        Self {
            injector,
            upstream,
            ca,
            verbose,
        }
    }

    fn log_request(&self, request_id: &Uuid, method: &Method, target: &str) {
        if self.verbose {
            info!(%request_id, %method, %target, "Proxying request");
        } else {
            debug!(%request_id, %method, %target, "Proxying request");
        }
    }

    async fn forward(&self, mut req: Request, target: &str) -> Result<Response, ProxyError> {
        let url = reqwest::Url::parse(target).map_err(|e| ProxyError::InvalidTarget(format!("{target}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ProxyError::InvalidTarget(target.to_string()));
        }

        let request_id = Uuid::new_v4();
        self.log_request(&request_id, req.method(), target);

        self.injector.inject(&mut req, "").await?;

        let resp = self.upstream.forward(req, url).await?;
        if self.verbose {
            info!(%request_id, status = resp.status().as_u16(), "Upstream responded");
        }
        Ok(resp)
    }

    fn connect(&self, req: Request) -> Result<Response, ProxyError> {
        let authority = req
            .uri()
            .authority()
            .cloned()
            .ok_or_else(|| ProxyError::InvalidTarget(req.uri().to_string()))?;

        let request_id = Uuid::new_v4();
        self.log_request(&request_id, req.method(), authority.as_str());

        let this = self.clone();
        tokio::spawn(async move {
            let result = match hyper::upgrade::on(req).await {
                Ok(upgraded) => this.intercept(upgraded, authority.host(), authority.port_u16()).await,
                Err(e) => Err(MitmError::Upgrade(e.to_string())),
            };
            if let Err(e) = result {
                warn!(%request_id, authority = %authority, error = %e, "CONNECT tunnel ended with error");
            }
        });

        Ok(Response::new(Body::empty()))
    }

    /// Terminate TLS on the hijacked connection and serve HTTP/1.1 inside it.
    async fn intercept(&self, upgraded: Upgraded, host: &str, port: Option<u16>) -> Result<(), MitmError> {
        let acceptor = TlsAcceptor::from(self.ca.server_config(certificate_host(host))?);
        let tls = acceptor
            .accept(TokioIo::new(upgraded))
            .await
            .map_err(MitmError::Handshake)?;

        let origin = match port {
            Some(port) if port != 443 => format!("https://{host}:{port}"),
            _ => format!("https://{host}"),
        };

        let this = self.clone();
        let service = service_fn(move |req: hyper::Request<Incoming>| {
            let this = this.clone();
            let origin = origin.clone();
            async move { Ok::<_, Infallible>(this.tunnelled(req.map(Body::new), &origin).await) }
        });

        hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(tls), service)
            .await?;
        Ok(())
    }

    async fn tunnelled(&self, req: Request, origin: &str) -> Response {
        let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let target = format!("{origin}{path}");
        self.forward(req, &target)
            .await
            .unwrap_or_else(IntoResponse::into_response)
    }
}

/// `Authority::host` keeps the brackets around IPv6 literals; the leaf needs
/// the bare address so it carries an IP SAN.
fn certificate_host(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

impl<F: TokenSourceFactory> ProxyTransport for ForwardProxy<F> {
    fn intercepts(&self, req: &Request) -> bool {
        req.method() == Method::CONNECT || is_absolute_form(req.uri())
    }

    async fn handle(&self, req: Request) -> Response {
        let result = if req.method() == Method::CONNECT {
            self.connect(req)
        } else if is_absolute_form(req.uri()) {
            let target = req.uri().to_string();
            self.forward(req, &target).await
        } else {
            Err(ProxyError::NotProxyRequest)
        };
        result.unwrap_or_else(IntoResponse::into_response)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::StatusCode;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::cache::TokenSourceCache;
    use crate::mocks::MockTokenSourceFactory;

    fn forward(factory: &MockTokenSourceFactory) -> ForwardProxy<MockTokenSourceFactory> {
        let cache = TokenSourceCache::new(factory.clone(), CancellationToken::new(), Duration::from_secs(60));
        let injector = Injector::new(Arc::new(cache), "https://backend.example");
        let ca = Arc::new(CertificateAuthority::generate().unwrap());
        ForwardProxy::new(injector, Upstream::new().unwrap(), ca, false)
    }

    fn request(method: Method, uri: &str) -> Request {
        Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn intercepts_connect_and_absolute_form_only() {
        let proxy = forward(&MockTokenSourceFactory::new());

        assert!(proxy.intercepts(&request(Method::CONNECT, "example.test:443")));
        assert!(proxy.intercepts(&request(Method::GET, "http://example.test/x")));
        assert!(!proxy.intercepts(&request(Method::GET, "/idtoken/proxy")));
        assert!(!proxy.intercepts(&request(Method::POST, "/idtoken")));
    }

    #[test]
    fn certificate_host_unwraps_ipv6_literals() {
        let authority: axum::http::uri::Authority = "[::1]:8443".parse().unwrap();
        assert_eq!(authority.host(), "[::1]");
        assert_eq!(certificate_host(authority.host()), "::1");
        assert_eq!(certificate_host("example.test"), "example.test");
        assert_eq!(certificate_host("127.0.0.1"), "127.0.0.1");

        let ca = CertificateAuthority::generate().unwrap();
        assert!(ca.server_config(certificate_host(authority.host())).is_ok());
    }

    #[tokio::test]
    async fn absolute_form_request_is_forwarded_with_token() {
        let server = httpmock::MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.path("/hello")
                    .header("authorization", "Bearer id-token-for-https://backend.example");
                then.status(200).body("hi");
            })
            .await;

        let proxy = forward(&MockTokenSourceFactory::new());
        let resp = proxy.handle(request(Method::GET, &server.url("/hello"))).await;

        assert_eq!(resp.status(), StatusCode::OK);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn mint_failure_is_500_without_forwarding() {
        let server = httpmock::MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.any_request();
                then.status(200);
            })
            .await;

        let factory = MockTokenSourceFactory::new();
        factory.fail_fetch(true);
        let proxy = forward(&factory);
        let resp = proxy.handle(request(Method::GET, &server.url("/hello"))).await;

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        mock.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn origin_form_request_is_refused() {
        let proxy = forward(&MockTokenSourceFactory::new());
        let resp = proxy.handle(request(Method::GET, "/idtoken/proxy")).await;

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(
            &body[..],
            b"This is a proxy server. Does not respond to non-proxy requests."
        );
    }

    #[tokio::test]
    async fn non_http_scheme_is_rejected() {
        let factory = MockTokenSourceFactory::new();
        let proxy = forward(&factory);
        let resp = proxy.handle(request(Method::GET, "ftp://example.test/file")).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(factory.created(), 0);
    }
}
