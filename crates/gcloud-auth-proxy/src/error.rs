//! Error types shared by the cache, the injector and the HTTP surfaces.

use thiserror::Error;

/// Failures obtaining a credential for an audience.
///
/// The collaborator's message is carried as a string so the error stays
/// `Clone` and independent of the concrete token-source implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CredentialError {
    /// The token-issuing collaborator could not create a token source.
    #[error("failed to create token source for audience {audience:?}: {message}")]
    Issuance { audience: String, message: String },

    /// A token source exists but minting a fresh token failed.
    #[error("failed to fetch token for audience {audience:?}: {message}")]
    TokenFetch { audience: String, message: String },
}

impl CredentialError {
    pub fn issuance(audience: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Issuance {
            audience: audience.into(),
            message: err.to_string(),
        }
    }

    pub fn token_fetch(audience: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::TokenFetch {
            audience: audience.into(),
            message: err.to_string(),
        }
    }

    pub fn audience(&self) -> &str {
        match self {
            Self::Issuance { audience, .. } | Self::TokenFetch { audience, .. } => audience,
        }
    }

    /// Short label for the phase that failed, used in logs and proxy bodies.
    pub fn phase(&self) -> &'static str {
        match self {
            Self::Issuance { .. } => "token source creation",
            Self::TokenFetch { .. } => "token fetch",
        }
    }
}
