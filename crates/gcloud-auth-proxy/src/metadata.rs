//! Google ID tokens from the GCE / Cloud Run metadata server.
//!
//! ```text
//! GET http://{host}/computeMetadata/v1/instance/service-accounts/default/identity
//!     ?audience={audience}&format=full
//! Metadata-Flavor: Google
//! ```
//!
//! The response body is the signed JWT. Its `exp` claim is read (not
//! verified) to learn the expiry. A source hands out the same token until it
//! is within [`EXPIRY_DELTA_SECS`] of expiring.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::token::{Token, TokenSource, TokenSourceFactory};

pub const DEFAULT_METADATA_HOST: &str = "169.254.169.254";

const IDENTITY_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/identity";
const METADATA_FLAVOR: (&str, &str) = ("Metadata-Flavor", "Google");
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Tokens this close to expiry (seconds) are refetched instead of reused.
pub const EXPIRY_DELTA_SECS: i64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("audience must not be empty")]
    EmptyAudience,

    #[error("shutting down: context canceled")]
    Canceled,

    #[error("metadata server request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("metadata server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed ID token: {0}")]
    MalformedToken(String),
}

#[derive(Clone)]
pub struct MetadataTokenSourceFactory {
    client: reqwest::Client,
    base_url: Arc<str>,
}

impl MetadataTokenSourceFactory {
    /// `host` is `host[:port]` without a scheme, as in `GCE_METADATA_HOST`.
    pub fn new(host: &str) -> Result<Self, MetadataError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self::with_client(client, host))
    }

    pub fn with_client(client: reqwest::Client, host: &str) -> Self {
        Self {
            client,
            base_url: format!("http://{host}").into(),
        }
    }
}

impl TokenSourceFactory for MetadataTokenSourceFactory {
    type Source = MetadataTokenSource;
    type Error = MetadataError;

    async fn token_source(
        &self,
        shutdown: &CancellationToken,
        audience: &str,
    ) -> Result<MetadataTokenSource, MetadataError> {
        if audience.is_empty() {
            return Err(MetadataError::EmptyAudience);
        }
        if shutdown.is_cancelled() {
            return Err(MetadataError::Canceled);
        }
        Ok(MetadataTokenSource {
            client: self.client.clone(),
            url: format!("{}{}", self.base_url, IDENTITY_PATH),
            audience: audience.to_string(),
            shutdown: shutdown.clone(),
            current: Mutex::new(None),
        })
    }
}

pub struct MetadataTokenSource {
    client: reqwest::Client,
    url: String,
    audience: String,
    shutdown: CancellationToken,
    current: Mutex<Option<Token>>,
}

impl MetadataTokenSource {
    async fn fetch(&self) -> Result<Token, MetadataError> {
        let resp = self
            .client
            .get(&self.url)
            .query(&[("audience", self.audience.as_str()), ("format", "full")])
            .header(METADATA_FLAVOR.0, METADATA_FLAVOR.1)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(MetadataError::Status {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }

        let jwt = body.trim().to_string();
        let expiry = jwt_expiry(&jwt)?;

        debug!(audience = %self.audience, expiry = %expiry, "Fetched ID token from metadata server");

        Ok(Token {
            access_token: jwt,
            refresh_token: String::new(),
            token_type: "Bearer".to_string(),
            expiry,
        })
    }
}

impl TokenSource for MetadataTokenSource {
    type Error = MetadataError;

    async fn token(&self) -> Result<Token, MetadataError> {
        let mut current = self.current.lock().await;

        if let Some(tok) = current.as_ref() {
            if tok.expiry - chrono::Duration::seconds(EXPIRY_DELTA_SECS) > Utc::now() {
                return Ok(tok.clone());
            }
        }

        // In-flight fetches run to completion; only new ones are refused.
        if self.shutdown.is_cancelled() {
            return Err(MetadataError::Canceled);
        }

        let tok = self.fetch().await?;
        *current = Some(tok.clone());
        Ok(tok)
    }
}

#[derive(Deserialize)]
struct Claims {
    exp: i64,
}

/// Read the `exp` claim from a compact JWT without checking its signature.
pub fn jwt_expiry(jwt: &str) -> Result<DateTime<Utc>, MetadataError> {
    let mut parts = jwt.split('.');
    let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => return Err(MetadataError::MalformedToken("expected three segments".to_string())),
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| MetadataError::MalformedToken(format!("payload is not base64url: {e}")))?;
    let claims: Claims = serde_json::from_slice(&bytes)
        .map_err(|e| MetadataError::MalformedToken(format!("payload has no numeric exp: {e}")))?;

    DateTime::from_timestamp(claims.exp, 0)
        .ok_or_else(|| MetadataError::MalformedToken(format!("exp {} out of range", claims.exp)))
}
