//! Resolved caller identity attached to a request after validation.

use serde::{Deserialize, Serialize};

/// Which validator accepted the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    /// Simple opaque bearer secret.
    Bearer,
    /// Federated JWT verified against the IdP's JWKS.
    FederatedJwt,
    /// Cloudflare-Access-style JWT assertion header.
    CloudflareAccess,
}

impl AuthMethod {
    /// Stable string tag used in audit records.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bearer => "bearer",
            Self::FederatedJwt => "federated-jwt",
            Self::CloudflareAccess => "cloudflare-access",
        }
    }
}

/// Caller identity produced once per request by the auth middleware.
///
/// Owned by the request/response cycle: injected as a request extension,
/// never persisted, discarded when the request completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatedIdentity {
    /// User or session identifier (`sub` claim for JWTs, `"bearer"` otherwise).
    pub subject: String,
    /// Email address, when the credential carried one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Which validator accepted the request.
    pub auth_method: AuthMethod,
    /// Session identifier, when the credential carried one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Downstream service credential resolved for an authenticated request.
///
/// The plaintext value lives only in this request-scoped struct; the vault
/// stores it encrypted.
#[derive(Debug, Clone)]
pub struct ServiceCredential {
    /// Service the credential is scoped to (e.g., `"coda"`).
    pub service: String,
    /// Logical sub-key within the service (e.g., `"api_token"`).
    pub key: String,
    /// Plaintext secret.
    pub value: String,
}
