//! Error types for the auth gateway

use std::io;

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for the auth gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Auth gateway errors
///
/// Each variant maps to exactly one external failure class. Validators return
/// structured reasons internally; the middleware collapses everything
/// credential-related to a uniform 401 so callers cannot tell which validator
/// almost succeeded. The full detail survives only in the audit log.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error — fatal at startup, the process refuses to run
    /// in a half-authenticated state.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Authorization header absent or structurally wrong. Always 401.
    #[error("Malformed credential: {0}")]
    MalformedCredential(String),

    /// Credential parsed fine but failed verification (bad signature,
    /// audience/issuer mismatch, expired, wrong secret). Always 401.
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    /// Authorization code unknown, expired, already used, or PKCE mismatch.
    /// Reported uniformly as `invalid_grant`; detail lives in the audit log.
    #[error("Code redemption failed")]
    CodeRedemption,

    /// Too many requests in the current window. Retryable after the hint.
    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded {
        /// Seconds until the window resets.
        retry_after_secs: u64,
    },

    /// JWKS fetch failure, identity-provider outage, delegated verification
    /// timeout. 503 — never conflated with an invalid credential.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Encryption/decryption failure in the token vault.
    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status code this error maps to at the edge.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MalformedCredential(_) | Self::InvalidCredential(_) => StatusCode::UNAUTHORIZED,
            Self::CodeRedemption => StatusCode::BAD_REQUEST,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamUnavailable(_) | Self::Http(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code for JSON response bodies.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIGURATION_ERROR",
            // Malformed and invalid credentials share one external code; the
            // distinction survives only in the audit log.
            Self::MalformedCredential(_) | Self::InvalidCredential(_) => "INVALID_TOKEN",
            Self::CodeRedemption => "invalid_grant",
            Self::RateLimitExceeded { .. } => "RATE_LIMITED",
            Self::UpstreamUnavailable(_) | Self::Http(_) => "AUTH_UNAVAILABLE",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Whether the client may retry (with backoff) after this failure.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded { .. } | Self::UpstreamUnavailable(_) | Self::Http(_)
        )
    }
}
