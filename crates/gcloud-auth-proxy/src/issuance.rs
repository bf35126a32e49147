//! `POST /idtoken`: hand a freshly fetched ID token straight to the caller.
//!
//! The audience comes from the `audience` form field: a urlencoded or
//! multipart body first, then the query string. Missing or empty means the
//! default audience.

use axum::body::Body;
use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::error::CredentialError;
use crate::inject::Injector;
use crate::token::TokenSourceFactory;

/// Upper bound on a form body.
const MAX_FORM_BYTES: usize = 10 << 20;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const MULTIPART_CONTENT_TYPE: &str = "multipart/form-data";
const AUDIENCE_FIELD: &str = "audience";

#[derive(Debug, Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct IdTokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

#[derive(Debug, Error)]
pub enum IssuanceResponseError {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("failed to read request body: {0}")]
    ReadBody(String),

    #[error("failed to encode token response: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl IntoResponse for IssuanceResponseError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Credential(e) => {
                error!(audience = %e.audience(), phase = e.phase(), error = %self, "ID token issuance failed");
                StatusCode::BAD_REQUEST
            }
            Self::ReadBody(_) => {
                warn!(error = %self, "Rejected ID token request");
                StatusCode::BAD_REQUEST
            }
            Self::Encoding(_) => {
                error!(error = %self, "ID token issuance failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        status.into_response()
    }
}

pub async fn issue<F: TokenSourceFactory>(State(injector): State<Injector<F>>, req: Request) -> Response {
    issue_token(&injector, req)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn issue_token<F: TokenSourceFactory>(injector: &Injector<F>, req: Request) -> Result<Response, IssuanceResponseError> {
    let requested = requested_audience(req).await?.unwrap_or_default();
    let audience = injector.resolve_audience(&requested).to_string();

    let token = injector.token(&audience).await?;
    let payload = IdTokenResponse {
        expires_in: token.expires_in(Utc::now()),
        access_token: token.access_token,
        refresh_token: token.refresh_token,
        token_type: token.token_type,
    };
    let json = serde_json::to_vec(&payload)?;
    debug!(audience = %audience, expires_in = payload.expires_in, "Issued ID token");

    let mut resp = Response::new(Body::from(json));
    let headers = resp.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    Ok(resp)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    UrlEncoded,
    Multipart,
    Other,
}

fn body_kind(headers: &HeaderMap) -> BodyKind {
    let mime = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|ct| ct.split(';').next())
        .map(str::trim)
        .unwrap_or_default();

    if mime.eq_ignore_ascii_case(FORM_CONTENT_TYPE) {
        BodyKind::UrlEncoded
    } else if mime.eq_ignore_ascii_case(MULTIPART_CONTENT_TYPE) {
        BodyKind::Multipart
    } else {
        BodyKind::Other
    }
}

/// First `audience` value, form body before query string.
async fn requested_audience(req: Request) -> Result<Option<String>, IssuanceResponseError> {
    let from_query = req
        .uri()
        .query()
        .and_then(|q| first_value(q.as_bytes(), AUDIENCE_FIELD));

    let from_body = match body_kind(req.headers()) {
        BodyKind::UrlEncoded => {
            let body = axum::body::to_bytes(req.into_body(), MAX_FORM_BYTES)
                .await
                .map_err(|e| IssuanceResponseError::ReadBody(e.to_string()))?;
            first_value(&body, AUDIENCE_FIELD)
        }
        BodyKind::Multipart => multipart_value(req, AUDIENCE_FIELD).await?,
        BodyKind::Other => None,
    };

    Ok(from_body.or(from_query))
}

async fn multipart_value(req: Request, key: &str) -> Result<Option<String>, IssuanceResponseError> {
    let mut multipart = Multipart::from_request(req, &())
        .await
        .map_err(|e| IssuanceResponseError::ReadBody(e.body_text()))?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| IssuanceResponseError::ReadBody(e.body_text()))?
    {
        if field.name() == Some(key) {
            let value = field
                .text()
                .await
                .map_err(|e| IssuanceResponseError::ReadBody(e.body_text()))?;
            return Ok(Some(value));
        }
    }
    Ok(None)
}

fn first_value(input: &[u8], key: &str) -> Option<String> {
    serde_urlencoded::from_bytes::<Vec<(String, String)>>(input)
        .ok()?
        .into_iter()
        .find_map(|(k, v)| (k == key).then_some(v))
}
