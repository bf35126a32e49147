//! Fetches a live token through the cache and stamps it on requests.

use std::sync::Arc;

use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderValue, Request};

use crate::cache::TokenSourceCache;
use crate::error::CredentialError;
use crate::token::{Token, TokenSource, TokenSourceFactory};

pub struct Injector<F: TokenSourceFactory> {
    cache: Arc<TokenSourceCache<F>>,
    default_audience: String,
}

impl<F: TokenSourceFactory> Clone for Injector<F> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            default_audience: self.default_audience.clone(),
        }
    }
}

impl<F: TokenSourceFactory> Injector<F> {
    pub fn new(cache: Arc<TokenSourceCache<F>>, default_audience: impl Into<String>) -> Self {
        Self {
            cache,
            default_audience: default_audience.into(),
        }
    }

    pub fn default_audience(&self) -> &str {
        &self.default_audience
    }

    pub fn cache(&self) -> &Arc<TokenSourceCache<F>> {
        &self.cache
    }

    /// An empty audience means the configured default. Anything else is used
    /// verbatim.
    pub fn resolve_audience<'a>(&'a self, audience: &'a str) -> &'a str {
        if audience.is_empty() {
            &self.default_audience
        } else {
            audience
        }
    }

    /// Mint a token for `audience` (empty → default).
    ///
    /// The cache only holds the token source; the source is asked for a token
    /// on every call. Failures are logged where they become a response.
    pub async fn token(&self, audience: &str) -> Result<Token, CredentialError> {
        let audience = self.resolve_audience(audience);
        let source = self.cache.get_or_create(audience).await?;
        source
            .token()
            .await
            .map_err(|e| CredentialError::token_fetch(audience, e))
    }

    /// Set `Authorization: <token_type> <access_token>` on `req`, replacing
    /// whatever the caller sent.
    pub async fn inject<B>(&self, req: &mut Request<B>, audience: &str) -> Result<(), CredentialError> {
        let token = self.token(audience).await?;
        let audience = self.resolve_audience(audience);

        let value = HeaderValue::from_str(&token.authorization())
            .map_err(|e| CredentialError::token_fetch(audience, format!("token is not a valid header value: {e}")))?;

        req.headers_mut().insert(AUTHORIZATION, value);
        Ok(())
    }
}
