#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use axum::body::Body;
use chrono::Utc;
use gcloud_auth_proxy::proxy::{CertificateAuthority, ForwardProxy, ProxyTransport, ReverseProxy, Upstream};
use gcloud_auth_proxy::{EvictionPolicy, IdTokenService, Token, TokenSource, TokenSourceFactory, server};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_AUDIENCE: &str = "https://default.example";

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct StubError(String);

#[derive(Default)]
struct State {
    created: AtomicUsize,
    fail_fetch: AtomicBool,
}

/// Issues `stub-token-{audience}`; fetches can be made to fail.
#[derive(Clone, Default)]
pub struct StubFactory {
    state: Arc<State>,
}

impl StubFactory {
    pub fn fail_fetch(&self) {
        self.state.fail_fetch.store(true, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }
}

pub struct StubSource {
    audience: String,
    state: Arc<State>,
}

impl TokenSource for StubSource {
    type Error = StubError;

    async fn token(&self) -> Result<Token, StubError> {
        if self.state.fail_fetch.load(Ordering::SeqCst) {
            return Err(StubError("identity endpoint returned 403".to_string()));
        }
        Ok(Token {
            access_token: format!("stub-token-{}", self.audience),
            refresh_token: String::new(),
            token_type: "bearer".to_string(),
            expiry: Utc::now() + chrono::Duration::minutes(30),
        })
    }
}

impl TokenSourceFactory for StubFactory {
    type Source = StubSource;
    type Error = StubError;

    async fn token_source(&self, _shutdown: &CancellationToken, audience: &str) -> Result<StubSource, StubError> {
        self.state.created.fetch_add(1, Ordering::SeqCst);
        Ok(StubSource {
            audience: audience.to_string(),
            state: Arc::clone(&self.state),
        })
    }
}

pub struct RunningProxy {
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<std::io::Result<()>>,
}

impl RunningProxy {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("server did not stop")
            .expect("server task panicked")
            .expect("server returned an error");
    }
}

async fn spawn<P, B>(factory: StubFactory, build: B) -> RunningProxy
where
    P: ProxyTransport,
    B: FnOnce(&IdTokenService<StubFactory>) -> P,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let service = Arc::new(IdTokenService::new(
        factory,
        &shutdown,
        DEFAULT_AUDIENCE,
        Duration::from_secs(600),
        EvictionPolicy::Expired,
    ));
    let proxy = build(&service);
    let handle = tokio::spawn(server::serve(listener, service, proxy, shutdown.clone()));
    RunningProxy { addr, shutdown, handle }
}

pub async fn spawn_forward(factory: StubFactory, ca: Arc<CertificateAuthority>, upstream: Upstream) -> RunningProxy {
    spawn(factory, |service| {
        ForwardProxy::new(service.injector().clone(), upstream, ca, true)
    })
    .await
}

pub async fn spawn_reverse(factory: StubFactory, base: &str) -> RunningProxy {
    let base = reqwest::Url::parse(base).unwrap();
    spawn(factory, |service| {
        ReverseProxy::new(service.injector().clone(), Upstream::new().unwrap(), base)
    })
    .await
}

/// HTTPS server presenting a certificate for `host` issued by `ca`. Each
/// response body is `"{path} {authorization header}"`.
pub async fn spawn_tls_upstream(ca: &CertificateAuthority, host: &str) -> SocketAddr {
    let acceptor = TlsAcceptor::from(ca.server_config(host).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(stream).await else {
                    return;
                };
                let service = service_fn(|req: hyper::Request<Incoming>| async move {
                    let auth = req
                        .headers()
                        .get(hyper::header::AUTHORIZATION)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    let body = format!("{} {}", req.uri().path(), auth);
                    Ok::<_, Infallible>(hyper::Response::new(Body::from(body)))
                });
                let _ = http1::Builder::new().serve_connection(TokioIo::new(tls), service).await;
            });
        }
    });

    addr
}

pub fn root_certificate(ca: &CertificateAuthority) -> reqwest::Certificate {
    reqwest::Certificate::from_pem(ca.cert_pem().as_bytes()).unwrap()
}
