//! Per-audience cache of token sources.
//!
//! The cache memoizes the *token source*, not the token: every request still
//! asks the cached source for a token, and the source decides whether that
//! hits the network. Entries carry a deadline and are dropped by
//! [`TokenSourceCache::sweep`], which the service runs once a minute.
//!
//! One `tokio::sync::Mutex` guards the whole map. Creation of a missing entry
//! happens while the lock is held, so concurrent first requests for the same
//! audience produce exactly one call to the factory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::CredentialError;
use crate::token::TokenSourceFactory;

/// Used when `now + ttl` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Which entries a sweep removes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Remove entries whose deadline has passed (`deadline <= now`).
    #[default]
    Expired,
    /// Remove entries whose deadline is still in the future (`deadline > now`).
    ///
    /// Evicts fresh entries and keeps stale ones. Not reachable from the
    /// command line.
    Unexpired,
}

impl EvictionPolicy {
    pub fn should_evict(self, deadline: Instant, now: Instant) -> bool {
        match self {
            Self::Expired => deadline <= now,
            Self::Unexpired => deadline > now,
        }
    }
}

struct CachedSource<S> {
    source: Arc<S>,
    deadline: Instant,
}

pub struct TokenSourceCache<F: TokenSourceFactory> {
    factory: F,
    shutdown: CancellationToken,
    ttl: Duration,
    eviction: EvictionPolicy,
    entries: Mutex<HashMap<String, CachedSource<F::Source>>>,
}

impl<F: TokenSourceFactory> TokenSourceCache<F> {
    /// `shutdown` is handed to the factory for every source it creates.
    pub fn new(factory: F, shutdown: CancellationToken, ttl: Duration) -> Self {
        Self {
            factory,
            shutdown,
            ttl,
            eviction: EvictionPolicy::default(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_eviction(mut self, eviction: EvictionPolicy) -> Self {
        self.eviction = eviction;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn eviction(&self) -> EvictionPolicy {
        self.eviction
    }

    /// Return the cached source for `audience`, creating it on a miss.
    ///
    /// Creation failures are returned as [`CredentialError::Issuance`] and
    /// leave the cache untouched, so the next call tries again.
    pub async fn get_or_create(&self, audience: &str) -> Result<Arc<F::Source>, CredentialError> {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get(audience) {
            return Ok(Arc::clone(&entry.source));
        }

        let source = self
            .factory
            .token_source(&self.shutdown, audience)
            .await
            .map(Arc::new)
            .map_err(|e| CredentialError::issuance(audience, e))?;

        let now = Instant::now();
        let deadline = now
            .checked_add(self.ttl)
            .unwrap_or_else(|| now + FAR_FUTURE);

        entries.insert(
            audience.to_string(),
            CachedSource {
                source: Arc::clone(&source),
                deadline,
            },
        );

        info!(audience = %audience, ttl_secs = self.ttl.as_secs(), "Added token source to cache");

        Ok(source)
    }

    /// Remove every entry the eviction policy selects. Returns how many went.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();

        entries.retain(|audience, entry| {
            let evict = self.eviction.should_evict(entry.deadline, now);
            if evict {
                info!(audience = %audience, "Evicted token source from cache");
            }
            !evict
        });

        let evicted = before - entries.len();
        debug!(evicted, remaining = entries.len(), "Token source cache sweep finished");
        evicted
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn contains(&self, audience: &str) -> bool {
        self.entries.lock().await.contains_key(audience)
    }

    pub async fn deadline(&self, audience: &str) -> Option<Instant> {
        self.entries.lock().await.get(audience).map(|e| e.deadline)
    }
}
