//! In-process token-issuing collaborator for unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

use crate::token::{Token, TokenSource, TokenSourceFactory};

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct MockError(pub String);

#[derive(Default)]
struct Counters {
    created: AtomicUsize,
    fetched: AtomicUsize,
    fail_create: AtomicBool,
    fail_fetch: AtomicBool,
}

/// Counts creations and fetches; either phase can be switched to fail.
///
/// Clones share state.
#[derive(Clone, Default)]
pub struct MockTokenSourceFactory {
    counters: Arc<Counters>,
    create_delay: Duration,
}

impl MockTokenSourceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside `token_source` to widen race windows.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub fn fail_create(&self, fail: bool) {
        self.counters.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_fetch(&self, fail: bool) {
        self.counters.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.counters.created.load(Ordering::SeqCst)
    }

    pub fn fetched(&self) -> usize {
        self.counters.fetched.load(Ordering::SeqCst)
    }
}

pub struct MockTokenSource {
    audience: String,
    counters: Arc<Counters>,
}

impl TokenSource for MockTokenSource {
    type Error = MockError;

    async fn token(&self) -> Result<Token, MockError> {
        self.counters.fetched.fetch_add(1, Ordering::SeqCst);
        if self.counters.fail_fetch.load(Ordering::SeqCst) {
            return Err(MockError("provider rejected the request".to_string()));
        }
        Ok(Token {
            access_token: format!("id-token-for-{}", self.audience),
            refresh_token: String::new(),
            token_type: "Bearer".to_string(),
            expiry: Utc::now() + chrono::Duration::seconds(3600),
        })
    }
}

impl TokenSourceFactory for MockTokenSourceFactory {
    type Source = MockTokenSource;
    type Error = MockError;

    async fn token_source(
        &self,
        _shutdown: &CancellationToken,
        audience: &str,
    ) -> Result<MockTokenSource, MockError> {
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        if self.counters.fail_create.load(Ordering::SeqCst) {
            return Err(MockError("credentials not found".to_string()));
        }
        Ok(MockTokenSource {
            audience: audience.to_string(),
            counters: Arc::clone(&self.counters),
        })
    }
}

/// Counts WARN and ERROR events emitted on this thread while installed.
#[derive(Clone, Default)]
pub struct WarnCounter(Arc<AtomicUsize>);

impl WarnCounter {
    pub fn install(&self) -> DefaultGuard {
        tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl<S: Subscriber> Layer<S> for WarnCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() <= Level::WARN {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}
