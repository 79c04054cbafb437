//! OAuth discovery metadata.
//!
//! Implements the server side of RFC 8414 (OAuth Authorization Server
//! Metadata) and RFC 9728 (OAuth Protected Resource Metadata). Both
//! documents are pure functions of configuration: same inputs, same JSON,
//! no I/O, served without authentication.

use serde::{Deserialize, Serialize};

/// OAuth Authorization Server Metadata (RFC 8414).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    /// Authorization server issuer URL.
    pub issuer: String,

    /// Authorization endpoint URL.
    pub authorization_endpoint: String,

    /// Token endpoint URL.
    pub token_endpoint: String,

    /// JWKS endpoint URL.
    pub jwks_uri: String,

    /// Supported grant types.
    pub grant_types_supported: Vec<String>,

    /// Supported response types.
    pub response_types_supported: Vec<String>,

    /// Supported scopes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes_supported: Vec<String>,

    /// Supported token endpoint auth methods.
    pub token_endpoint_auth_methods_supported: Vec<String>,

    /// Supported PKCE code challenge methods.
    pub code_challenge_methods_supported: Vec<String>,
}

/// OAuth Protected Resource Metadata (RFC 9728).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    /// Protected resource identifier.
    pub resource: String,

    /// Authorization servers that can issue tokens for this resource.
    pub authorization_servers: Vec<String>,

    /// Supported bearer token presentation methods.
    pub bearer_methods_supported: Vec<String>,

    /// Supported scopes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes_supported: Vec<String>,
}

/// Build the RFC 8414 document for this gateway.
///
/// `base_url` is the externally visible origin (no trailing slash needed);
/// endpoint URLs are derived from it so the advertised document always
/// matches the routes actually served.
#[must_use]
pub fn authorization_server_metadata(
    base_url: &str,
    scopes: &[String],
) -> AuthorizationServerMetadata {
    let base = base_url.trim_end_matches('/');
    AuthorizationServerMetadata {
        issuer: base.to_string(),
        authorization_endpoint: format!("{base}/authorize"),
        token_endpoint: format!("{base}/token"),
        jwks_uri: format!("{base}/.well-known/jwks.json"),
        grant_types_supported: vec!["authorization_code".to_string()],
        response_types_supported: vec!["code".to_string()],
        scopes_supported: scopes.to_vec(),
        token_endpoint_auth_methods_supported: vec!["none".to_string()],
        code_challenge_methods_supported: vec!["S256".to_string(), "plain".to_string()],
    }
}

/// Build the RFC 9728 document for this gateway.
#[must_use]
pub fn protected_resource_metadata(
    base_url: &str,
    scopes: &[String],
) -> ProtectedResourceMetadata {
    let base = base_url.trim_end_matches('/');
    ProtectedResourceMetadata {
        resource: base.to_string(),
        authorization_servers: vec![base.to_string()],
        bearer_methods_supported: vec!["header".to_string()],
        scopes_supported: scopes.to_vec(),
    }
}
