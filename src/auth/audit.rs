//! Audit logging for authentication and token-store events.
//!
//! Every event is emitted via `tracing::info!` with structured fields, making
//! the audit trail queryable by any log aggregator (Loki, CloudWatch, Datadog).
//! Emission is best-effort: a serialization failure is reported to the
//! operational log and never propagated to the caller.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `auth.success` | A request passed one of the configured validators |
//! | `auth.failure` | Every validator rejected the request |
//! | `auth.rate_limited` | A request was rejected by the rate limiter |
//! | `vault.read` / `vault.write` / `vault.delete` | Token store operations |
//! | `vault.rotate` | A key rotation pass completed |
//! | `code.issued` | An authorization code was minted |
//! | `code.redeemed` | An authorization code was exchanged successfully |
//! | `code.rejected` | A redemption attempt failed (detail stays server-side) |

use serde::Serialize;
use serde_json::{Map, Value};

use super::identity::AuthenticatedIdentity;

/// Field-name fragments whose values are always masked before emission.
const SENSITIVE_FRAGMENTS: &[&str] = &["token", "secret", "password", "key", "authorization", "credential"];

/// Replacement for redacted values.
const REDACTED: &str = "[REDACTED]";

/// Structured audit event emitted for every security decision.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"auth.success"`).
    pub event: &'static str,
    /// Unique event id for cross-referencing with request logs.
    pub id: String,
    /// Identity involved, when one was resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<AuthenticatedIdentity>,
    /// Service name, for vault and code events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Request path, for auth decisions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Failure reason — full internal detail, redacted of secret values.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Free-form details, redacted before emission.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
}

impl AuditEvent {
    fn new(event: &'static str) -> Self {
        Self {
            event,
            id: uuid::Uuid::new_v4().to_string(),
            identity: None,
            service: None,
            path: None,
            reason: None,
            details: None,
        }
    }

    /// Construct an `auth.success` event.
    #[must_use]
    pub fn auth_success(identity: &AuthenticatedIdentity, path: &str) -> Self {
        Self {
            identity: Some(identity.clone()),
            path: Some(path.to_string()),
            ..Self::new("auth.success")
        }
    }

    /// Construct an `auth.failure` event carrying the internal reason.
    #[must_use]
    pub fn auth_failure(path: &str, reason: impl Into<String>) -> Self {
        Self {
            path: Some(path.to_string()),
            reason: Some(reason.into()),
            ..Self::new("auth.failure")
        }
    }

    /// Construct an `auth.rate_limited` event.
    #[must_use]
    pub fn rate_limited(path: &str, client_key: &str) -> Self {
        let mut details = Map::new();
        details.insert("client_key".to_string(), Value::String(client_key.to_string()));
        Self {
            path: Some(path.to_string()),
            details: Some(details),
            ..Self::new("auth.rate_limited")
        }
    }

    /// Construct a vault event (`vault.read`, `vault.write`, ...).
    #[must_use]
    pub fn vault(action: &'static str, service: &str, details: Option<Map<String, Value>>) -> Self {
        Self {
            service: Some(service.to_string()),
            details,
            ..Self::new(action)
        }
    }

    /// Construct a `code.issued` event.
    #[must_use]
    pub fn code_issued(service: &str, pkce: bool) -> Self {
        let mut details = Map::new();
        details.insert("pkce".to_string(), Value::Bool(pkce));
        Self {
            service: Some(service.to_string()),
            details: Some(details),
            ..Self::new("code.issued")
        }
    }

    /// Construct a `code.redeemed` event.
    #[must_use]
    pub fn code_redeemed(service: &str) -> Self {
        Self {
            service: Some(service.to_string()),
            ..Self::new("code.redeemed")
        }
    }

    /// Construct a `code.rejected` event with the server-side-only reason.
    #[must_use]
    pub fn code_rejected(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::new("code.rejected")
        }
    }

    /// Mask every detail value whose key looks sensitive.
    #[must_use]
    pub fn redacted(mut self) -> Self {
        if let Some(ref mut details) = self.details {
            for (k, v) in details.iter_mut() {
                let lower = k.to_lowercase();
                if SENSITIVE_FRAGMENTS.iter().any(|f| lower.contains(f)) {
                    *v = Value::String(REDACTED.to_string());
                }
            }
        }
        self
    }
}

/// Emit an audit event via `tracing::info!` with structured fields.
///
/// Redaction is applied unconditionally so no call site can forget it.
/// The event is serialized as a JSON blob in the `audit` field:
///
/// ```text
/// INFO auth::audit audit={"event":"auth.success","identity":...}
/// ```
pub fn emit(event: AuditEvent) {
    let event = event.redacted();
    match serde_json::to_string(&event) {
        Ok(ref json) => tracing::info!(audit = %json, "security audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
