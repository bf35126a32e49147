//! ID token service: owns the cache and its eviction loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::{EvictionPolicy, TokenSourceCache};
use crate::health::Health;
use crate::inject::Injector;
use crate::token::TokenSourceFactory;

/// How often the eviction sweep runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct IdTokenService<F: TokenSourceFactory> {
    injector: Injector<F>,
    shutdown: CancellationToken,
    sweep_interval: Duration,
    started: Arc<AtomicBool>,
}

impl<F: TokenSourceFactory> IdTokenService<F> {
    /// `shutdown` is the process-wide token. The service derives a child from
    /// it, so [`stop`](Self::stop) never cancels anything outside the service.
    pub fn new(
        factory: F,
        shutdown: &CancellationToken,
        default_audience: impl Into<String>,
        ttl: Duration,
        eviction: EvictionPolicy,
    ) -> Self {
        let shutdown = shutdown.child_token();
        let cache = TokenSourceCache::new(factory, shutdown.clone(), ttl).with_eviction(eviction);
        Self {
            injector: Injector::new(Arc::new(cache), default_audience),
            shutdown,
            sweep_interval: SWEEP_INTERVAL,
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    pub fn injector(&self) -> &Injector<F> {
        &self.injector
    }

    pub fn cache(&self) -> &Arc<TokenSourceCache<F>> {
        self.injector.cache()
    }

    /// Spawn the eviction loop. The service reports ready once the loop is
    /// running; it stops when the shutdown token is cancelled.
    pub fn start(&self) -> JoinHandle<()> {
        let cache = Arc::clone(self.injector.cache());
        let shutdown = self.shutdown.clone();
        let started = Arc::clone(&self.started);
        let period = self.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            started.store(true, Ordering::SeqCst);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Token source cache sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        cache.sweep().await;
                    }
                }
            }
        });

        info!(
            default_audience = %self.injector.default_audience(),
            ttl_secs = self.cache().ttl().as_secs(),
            eviction = ?self.cache().eviction(),
            "ID token service started"
        );

        handle
    }

    /// Stop the eviction loop. In-flight requests are left alone.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl<F: TokenSourceFactory> Health for IdTokenService<F> {
    fn is_healthy(&self) -> bool {
        true
    }

    fn is_ready(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}
