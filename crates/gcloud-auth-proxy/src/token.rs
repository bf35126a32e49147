//! [`Token`] value object and the token-issuing collaborator traits.
//!
//! The proxy never mints credentials itself. A [`TokenSourceFactory`] creates
//! one [`TokenSource`] per audience, and the source mints tokens on demand.
//! Both are async traits so the production implementation can talk to the
//! metadata server while tests plug in an in-process stub.

use std::future::Future;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// A minted bearer credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expiry: DateTime<Utc>,
}

impl Token {
    /// Token type with the usual OAuth2 casing applied.
    ///
    /// An empty type means `Bearer`.
    pub fn normalized_type(&self) -> &str {
        let t = self.token_type.as_str();
        if t.is_empty() || t.eq_ignore_ascii_case("bearer") {
            "Bearer"
        } else if t.eq_ignore_ascii_case("mac") {
            "MAC"
        } else if t.eq_ignore_ascii_case("basic") {
            "Basic"
        } else {
            t
        }
    }

    /// Value for the `Authorization` header: `"<token_type> <access_token>"`.
    pub fn authorization(&self) -> String {
        format!("{} {}", self.normalized_type(), self.access_token)
    }

    /// Whole seconds between `now` and the expiry, truncated toward zero.
    ///
    /// Negative once the token has expired.
    pub fn expires_in(&self, now: DateTime<Utc>) -> i64 {
        (self.expiry - now).num_seconds()
    }
}

/// A reusable capability that mints tokens for one audience.
pub trait TokenSource: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Mint (or return a still-valid) token. May hit the network.
    fn token(&self) -> impl Future<Output = Result<Token, Self::Error>> + Send;
}

/// Creates [`TokenSource`]s for audiences.
///
/// `shutdown` is the process-scoped cancellation token; sources may use it to
/// refuse new work once the process is shutting down.
pub trait TokenSourceFactory: Send + Sync + 'static {
    type Source: TokenSource;
    type Error: std::error::Error + Send + Sync + 'static;

    fn token_source(
        &self,
        shutdown: &CancellationToken,
        audience: &str,
    ) -> impl Future<Output = Result<Self::Source, Self::Error>> + Send;
}
