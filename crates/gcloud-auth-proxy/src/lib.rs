//! Sidecar that attaches Google ID tokens to outgoing HTTP requests.
//!
//! # Architecture
//!
//! ```text
//! Service ── HTTP_PROXY / HTTPS_PROXY ──▶ [forward proxy]  ─┐
//! Service ── /idtoken/proxy/... ────────▶ [reverse proxy]  ─┤
//!                                                           ↓ Injector: Authorization: Bearer <id token>
//!                                          TokenSourceCache (one source per audience, TTL + sweep)
//!                                                           ↓ TokenSourceFactory
//!                                          GCE metadata server /identity?audience=…
//!                                                           ↓
//!                                          upstream service (reqwest)
//!
//! Service ── POST /idtoken ─────────────▶ JSON token for the requested audience
//! Orchestrator ── /healthz, /readyz ────▶ HealthCheck (IdTokenService readiness)
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod inject;
pub mod issuance;
pub mod metadata;
pub mod proxy;
pub mod server;
pub mod service;
pub mod signal;
pub mod token;

#[cfg(test)]
mod mocks;

pub use cache::{EvictionPolicy, TokenSourceCache};
pub use config::{Args, Config};
pub use error::CredentialError;
pub use inject::Injector;
pub use service::IdTokenService;
pub use token::{Token, TokenSource, TokenSourceFactory};
