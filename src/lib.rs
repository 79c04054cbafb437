//! MCP Auth Gateway Library
//!
//! Authentication and authorization layer for MCP gateway deployments.
//!
//! # Features
//!
//! - **Bearer validation**: exact-match (constant-time) or delegated to the
//!   protected API's own verification endpoint
//! - **Federated JWT**: signature verification against a remote JWKS with a
//!   pinned algorithm, exact issuer/audience checks
//! - **OAuth discovery**: RFC 8414 / RFC 9728 metadata, JWKS proxying
//! - **Code exchange**: single-use authorization codes with PKCE (RFC 7636)
//! - **Encrypted vault**: AES-256-GCM credential storage with key rotation
//! - **Operational**: per-client rate limiting, redacted audit trail,
//!   graceful shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod oauth;
pub mod server;
pub mod vault;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Returns an error if the subscriber cannot be initialized.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
