//! HTTP surface: routes, proxy interception, and the serve loop.
//!
//! | Path                      | Methods | Handler                         |
//! |---------------------------|---------|---------------------------------|
//! | `/idtoken`                | POST    | [`issuance::issue`]             |
//! | `/idtoken/proxy[/{*rest}]`| any     | [`ProxyTransport::handle`]      |
//! | `/healthz`, `/readyz`     | any     | [`health`] aggregation          |
//!
//! In forward mode CONNECT and absolute-form requests never reach this table.

use std::io;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{any, post};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, ProxySettings};
use crate::health::{self, HealthCheck};
use crate::inject::Injector;
use crate::issuance;
use crate::metadata::MetadataTokenSourceFactory;
use crate::proxy::{CertificateAuthority, ForwardProxy, PROXY_PATH, ProxyTransport, ReverseProxy, Upstream};
use crate::service::IdTokenService;
use crate::token::TokenSourceFactory;

pub fn router<F, P>(injector: Injector<F>, proxy: Arc<P>, health: HealthCheck) -> Router
where
    F: TokenSourceFactory,
    P: ProxyTransport,
{
    let issuance = Router::new()
        .route("/idtoken", post(issuance::issue::<F>))
        .with_state(injector);

    let proxied = Router::new()
        .route(PROXY_PATH, any(proxy_entry::<P>))
        .route(&format!("{PROXY_PATH}/{{*rest}}"), any(proxy_entry::<P>))
        .with_state(Arc::clone(&proxy));

    let probes = Router::new()
        .route("/healthz", any(health::healthz))
        .route("/readyz", any(health::readyz))
        .with_state(health);

    let routed = Router::new().merge(issuance).merge(proxied).merge(probes);

    // Interception has to see every request before path matching.
    Router::new()
        .fallback_service(routed)
        .layer(middleware::from_fn_with_state(proxy, intercept::<P>))
}

async fn proxy_entry<P: ProxyTransport>(State(proxy): State<Arc<P>>, req: Request) -> Response {
    proxy.handle(req).await
}

async fn intercept<P: ProxyTransport>(State(proxy): State<Arc<P>>, req: Request, next: Next) -> Response {
    if proxy.intercepts(&req) {
        proxy.handle(req).await
    } else {
        next.run(req).await
    }
}

/// Serve until `shutdown` fires. The service's sweep loop starts once the
/// routes are in place and stops with the listener.
pub async fn serve<F, P>(
    listener: TcpListener,
    service: Arc<IdTokenService<F>>,
    proxy: P,
    shutdown: CancellationToken,
) -> io::Result<()>
where
    F: TokenSourceFactory,
    P: ProxyTransport,
{
    let mut health = HealthCheck::new();
    health.register(service.clone());
    let app = router(service.injector().clone(), Arc::new(proxy), health);

    let sweeper = service.start();

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await;

    service.stop();
    if let Err(e) = sweeper.await {
        warn!(error = %e, "Token source cache sweeper panicked");
    }
    result
}

/// Build the production stack from `config` and serve it.
pub async fn run(config: Config, shutdown: CancellationToken) -> anyhow::Result<()> {
    let factory = MetadataTokenSourceFactory::new(&config.metadata_host)
        .context("failed to build metadata server client")?;
    let service = Arc::new(IdTokenService::new(
        factory,
        &shutdown,
        config.default_audience.clone(),
        config.cache_ttl,
        config.eviction,
    ));
    let upstream = Upstream::new().context("failed to build upstream HTTP client")?;
    let injector = service.injector().clone();

    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?;
    info!(
        addr = %listener.local_addr()?,
        mode = ?config.proxy_mode(),
        default_audience = %config.default_audience,
        "Listening"
    );

    match config.proxy {
        ProxySettings::Reverse { upstream: base } => {
            info!(upstream = %base, "Reverse proxy enabled");
            let proxy = ReverseProxy::new(injector, upstream, base);
            serve(listener, service, proxy, shutdown).await?;
        }
        ProxySettings::Forward { verbose, ca } => {
            let ca = match ca {
                Some(paths) => CertificateAuthority::load(&paths)?,
                None => CertificateAuthority::generate()?,
            };
            let proxy = ForwardProxy::new(injector, upstream, Arc::new(ca), verbose);
            serve(listener, service, proxy, shutdown).await?;
        }
    }

    info!("Server stopped");
    Ok(())
}
