//! Authentication middleware for the gateway.
//!
//! Runs once per request, before any handler:
//!
//! 1. Exempt paths (health, discovery, the OAuth endpoints) pass through.
//! 2. The client's rate-limit budget is checked and the attempt recorded.
//! 3. Validators run in the order the configured mode dictates; the first
//!    success wins and attaches [`AuthenticatedIdentity`] (and the resolved
//!    downstream [`ServiceCredential`]) to the request extensions.
//! 4. No success: a uniform 401 with a `WWW-Authenticate` header pointing at
//!    the protected-resource metadata. Infrastructure failures (JWKS outage,
//!    delegated verification timeout) return 503 instead; an unreachable IdP
//!    must never be reported as a bad credential.
//!
//! Every outcome emits one audit event.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Request, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::audit::{self, AuditEvent};
use super::bearer::BearerValidator;
use super::identity::{AuthMethod, AuthenticatedIdentity, ServiceCredential};
use super::jwt::JwtValidator;
use super::rate_limit::{RateLimitDecision, RateLimiter};
use crate::Error;
use crate::vault::TokenVault;

/// Cloudflare Access delivers its JWT in this header rather than
/// `Authorization`.
const CF_ACCESS_HEADER: &str = "cf-access-jwt-assertion";

/// Which validators run, and in what order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Opaque bearer secret only.
    #[default]
    Bearer,
    /// Federated JWT only.
    Federated,
    /// Federated JWT first, bearer secret as fallback.
    Both,
}

/// Shared state for the auth middleware.
pub struct AuthState {
    /// Validator order.
    pub mode: AuthMode,
    /// Bearer validator, present when the mode includes bearer.
    pub bearer: Option<BearerValidator>,
    /// Federated validator, present when the mode includes federated.
    /// Shared with the JWKS proxy endpoint.
    pub federated: Option<Arc<JwtValidator>>,
    /// Rate limiter; `None` disables limiting.
    pub rate_limiter: Option<Arc<RateLimiter>>,
    /// Token vault for resolving the downstream service credential.
    pub vault: Option<Arc<dyn TokenVault>>,
    /// Which service's credential is attached to authenticated requests.
    pub credential_service: Option<String>,
    /// Which of that service's keys is resolved (`api_token` by default).
    pub credential_key: String,
    /// Advertised in `WWW-Authenticate` on 401 (RFC 9728).
    pub resource_metadata_url: String,
    /// Path prefixes that bypass authentication entirely.
    pub exempt_paths: Vec<String>,
}

impl AuthState {
    /// Check if a path bypasses authentication.
    #[must_use]
    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.iter().any(|p| path.starts_with(p))
    }
}

/// What a validation attempt produced, before it is turned into a response.
enum Attempt {
    Accepted(AuthenticatedIdentity),
    /// Credential failure. The carried error is for the audit log only.
    Denied(Error),
    /// Infrastructure failure. The credential was never evaluated.
    Unavailable(Error),
}

/// Authentication middleware entry point.
pub async fn auth_middleware(
    State(state): State<Arc<AuthState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    if state.is_exempt(&path) {
        debug!(path = %path, "Exempt path, skipping auth");
        return next.run(request).await;
    }

    if let Some(ref limiter) = state.rate_limiter {
        let client_key = client_key(request.headers());
        let decision = limiter.check_and_record(&client_key);
        if !decision.allowed {
            warn!(client = %client_key, path = %path, "Rate limit exceeded");
            audit::emit(AuditEvent::rate_limited(&path, &client_key));
            return rate_limited_response(&decision);
        }
    }

    match run_validators(&state, request.headers()).await {
        Attempt::Accepted(identity) => {
            audit::emit(AuditEvent::auth_success(&identity, &path));
            debug!(subject = %identity.subject, method = identity.auth_method.as_str(), path = %path, "Authenticated request");

            if let Some(credential) = resolve_credential(&state).await {
                request.extensions_mut().insert(credential);
            }
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Attempt::Denied(err) => {
            warn!(path = %path, reason = %err, "Authentication failed");
            audit::emit(AuditEvent::auth_failure(&path, err.to_string()));
            unauthorized_response(&state.resource_metadata_url)
        }
        Attempt::Unavailable(err) => {
            warn!(path = %path, reason = %err, "Auth infrastructure unavailable");
            audit::emit(AuditEvent::auth_failure(&path, err.to_string()));
            unavailable_response(&err)
        }
    }
}

/// Run the configured validators in mode order; first success wins.
async fn run_validators(state: &AuthState, headers: &HeaderMap) -> Attempt {
    let mut failures: Vec<Error> = Vec::new();

    if matches!(state.mode, AuthMode::Federated | AuthMode::Both) {
        match try_federated(state, headers).await {
            Attempt::Accepted(identity) => return Attempt::Accepted(identity),
            Attempt::Unavailable(err) => return Attempt::Unavailable(err),
            Attempt::Denied(err) => failures.push(err),
        }
    }

    if matches!(state.mode, AuthMode::Bearer | AuthMode::Both) {
        match try_bearer(state, headers).await {
            Attempt::Accepted(identity) => return Attempt::Accepted(identity),
            Attempt::Unavailable(err) => return Attempt::Unavailable(err),
            Attempt::Denied(err) => failures.push(err),
        }
    }

    match failures.len() {
        0 => Attempt::Denied(Error::InvalidCredential(
            "no validator configured for mode".to_string(),
        )),
        1 => Attempt::Denied(failures.remove(0)),
        _ => {
            let detail = failures
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            Attempt::Denied(Error::InvalidCredential(detail))
        }
    }
}

/// Try federated JWT validation: the Cloudflare Access assertion header takes
/// priority, then the standard `Authorization: Bearer` header.
async fn try_federated(state: &AuthState, headers: &HeaderMap) -> Attempt {
    let Some(ref validator) = state.federated else {
        return Attempt::Denied(Error::InvalidCredential(
            "federated validator not configured".to_string(),
        ));
    };

    let (token, method) = if let Some(assertion) = header_str(headers, CF_ACCESS_HEADER) {
        (assertion, AuthMethod::CloudflareAccess)
    } else if let Some(bearer) = header_str(headers, header::AUTHORIZATION.as_str())
        .and_then(|h| h.strip_prefix("Bearer "))
    {
        (bearer, AuthMethod::FederatedJwt)
    } else {
        return Attempt::Denied(Error::MalformedCredential(
            "jwt: no token presented".to_string(),
        ));
    };

    match validator.validate(token, method).await {
        Ok(identity) => Attempt::Accepted(identity),
        Err(err) => match Error::from(err) {
            e @ Error::UpstreamUnavailable(_) => Attempt::Unavailable(e),
            e => Attempt::Denied(e),
        },
    }
}

/// Try opaque bearer validation against the configured policy.
async fn try_bearer(state: &AuthState, headers: &HeaderMap) -> Attempt {
    let Some(ref validator) = state.bearer else {
        return Attempt::Denied(Error::InvalidCredential(
            "bearer validator not configured".to_string(),
        ));
    };

    let Some(header) = header_str(headers, header::AUTHORIZATION.as_str()) else {
        return Attempt::Denied(Error::MalformedCredential(
            "bearer: no authorization header".to_string(),
        ));
    };

    match validator.validate(header).await {
        Ok(_token) => Attempt::Accepted(AuthenticatedIdentity {
            subject: "bearer".to_string(),
            email: None,
            auth_method: AuthMethod::Bearer,
            session_id: None,
        }),
        Err(err) => match Error::from(err) {
            e @ Error::UpstreamUnavailable(_) => Attempt::Unavailable(e),
            e => Attempt::Denied(e),
        },
    }
}

/// Resolve the downstream service credential from the vault, best-effort.
///
/// A vault miss or read failure degrades to "no credential attached" rather
/// than failing a request the validators already accepted.
async fn resolve_credential(state: &AuthState) -> Option<ServiceCredential> {
    let vault = state.vault.as_ref()?;
    let service = state.credential_service.as_ref()?;
    let key = &state.credential_key;

    match vault.get_token(service, key).await {
        Ok(Some(value)) => Some(ServiceCredential {
            service: service.clone(),
            key: key.clone(),
            value,
        }),
        Ok(None) => {
            debug!(service = %service, key = %key, "No stored credential for service");
            None
        }
        Err(e) => {
            warn!(service = %service, key = %key, error = %e, "Failed to resolve service credential");
            None
        }
    }
}

/// Extract a header value as a string slice.
fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Client key for rate limiting: the first `X-Forwarded-For` hop, falling
/// back to a shared bucket when no proxy header is present.
pub(crate) fn client_key(headers: &HeaderMap) -> String {
    header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map_or_else(|| "direct".to_string(), |ip| ip.trim().to_string())
}

/// Uniform 401. The body never reveals which check failed: every credential
/// failure leaves as the same [`Error::InvalidCredential`] shape.
fn unauthorized_response(resource_metadata_url: &str) -> Response {
    let external = Error::InvalidCredential("invalid or expired token".to_string());
    let challenge = format!("Bearer resource_metadata=\"{resource_metadata_url}\"");
    let header_value = HeaderValue::from_str(&challenge)
        .unwrap_or_else(|_| HeaderValue::from_static("Bearer"));

    (
        external.status_code(),
        [(header::WWW_AUTHENTICATE, header_value)],
        Json(json!({
            "error": "Invalid or expired token",
            "code": external.code(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
        .into_response()
}

/// 503 for infrastructure failures. Distinct from 401 so clients retry
/// instead of discarding their (possibly valid) credentials.
fn unavailable_response(err: &Error) -> Response {
    (
        err.status_code(),
        Json(json!({
            "error": "authentication service temporarily unavailable",
            "code": err.code(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
        .into_response()
}

/// 429 with standard rate-limit headers.
fn rate_limited_response(decision: &RateLimitDecision) -> Response {
    let err = Error::RateLimitExceeded {
        retry_after_secs: decision.retry_after_secs(),
    };

    (
        err.status_code(),
        [
            ("x-ratelimit-limit", decision.limit.to_string()),
            ("x-ratelimit-remaining", decision.remaining.to_string()),
            ("x-ratelimit-reset", decision.reset_after.as_secs().to_string()),
            ("retry-after", decision.retry_after_secs().to_string()),
        ],
        Json(json!({
            "error": "too many authentication attempts",
            "code": err.code(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    use crate::auth::bearer::BearerPolicy;

    fn bearer_state(secret: &str) -> Arc<AuthState> {
        Arc::new(AuthState {
            mode: AuthMode::Bearer,
            bearer: Some(BearerValidator::new(BearerPolicy::Exact {
                secret: secret.to_string(),
            })),
            federated: None,
            rate_limiter: None,
            vault: None,
            credential_service: None,
            credential_key: crate::vault::DEFAULT_CREDENTIAL_KEY.to_string(),
            resource_metadata_url: "https://gw.example.com/.well-known/oauth-protected-resource"
                .to_string(),
            exempt_paths: vec!["/health".to_string(), "/.well-known/".to_string()],
        })
    }

    fn request_with_header(name: &str, value: &str) -> Request<Body> {
        Request::builder()
            .uri("/whoami")
            .header(name, value)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn exempt_paths_match_by_prefix() {
        let state = bearer_state("s");
        assert!(state.is_exempt("/health"));
        assert!(state.is_exempt("/.well-known/jwks.json"));
        assert!(!state.is_exempt("/whoami"));
        assert!(!state.is_exempt("/"));
    }

    #[test]
    fn auth_mode_deserializes_lowercase() {
        assert_eq!(
            serde_json::from_str::<AuthMode>("\"both\"").unwrap(),
            AuthMode::Both
        );
        assert_eq!(
            serde_json::from_str::<AuthMode>("\"federated\"").unwrap(),
            AuthMode::Federated
        );
        assert!(serde_json::from_str::<AuthMode>("\"Bearer\"").is_err());
    }

    #[test]
    fn client_key_prefers_first_forwarded_hop() {
        let request = request_with_header("x-forwarded-for", "203.0.113.9, 10.0.0.1");
        assert_eq!(client_key(request.headers()), "203.0.113.9");

        let bare = Request::builder().uri("/x").body(Body::empty()).unwrap();
        assert_eq!(client_key(bare.headers()), "direct");
    }

    #[tokio::test]
    async fn valid_bearer_is_accepted_with_identity() {
        let state = bearer_state("good-secret");
        let request = request_with_header("authorization", "Bearer good-secret");

        match run_validators(&state, request.headers()).await {
            Attempt::Accepted(identity) => {
                assert_eq!(identity.subject, "bearer");
                assert_eq!(identity.auth_method, AuthMethod::Bearer);
            }
            _ => panic!("expected acceptance"),
        }
    }

    #[tokio::test]
    async fn wrong_bearer_is_denied_not_unavailable() {
        let state = bearer_state("good-secret");
        let request = request_with_header("authorization", "Bearer wrong");

        match run_validators(&state, request.headers()).await {
            Attempt::Denied(err) => assert!(matches!(err, Error::InvalidCredential(_))),
            _ => panic!("expected denial"),
        }
    }

    #[tokio::test]
    async fn missing_header_is_denied_as_malformed() {
        let state = bearer_state("good-secret");
        let request = Request::builder()
            .uri("/whoami")
            .body(Body::empty())
            .unwrap();

        match run_validators(&state, request.headers()).await {
            Attempt::Denied(err) => {
                assert!(matches!(err, Error::MalformedCredential(_)));
                assert!(err.to_string().contains("no authorization header"));
            }
            _ => panic!("expected denial"),
        }
    }

    #[tokio::test]
    async fn both_mode_falls_back_to_bearer_after_jwt_denial() {
        use crate::auth::jwt::{JwtValidator, JwtValidatorConfig};
        use jsonwebtoken::Algorithm;

        let state = Arc::new(AuthState {
            mode: AuthMode::Both,
            bearer: Some(BearerValidator::new(BearerPolicy::Exact {
                secret: "fallback-secret".to_string(),
            })),
            federated: Some(Arc::new(JwtValidator::new(JwtValidatorConfig {
                issuer: "https://idp.example.com".to_string(),
                audience: "aud".to_string(),
                jwks_uri: None,
                algorithm: Algorithm::RS256,
            }))),
            rate_limiter: None,
            vault: None,
            credential_service: None,
            credential_key: crate::vault::DEFAULT_CREDENTIAL_KEY.to_string(),
            resource_metadata_url: "https://gw.example.com/.well-known/oauth-protected-resource"
                .to_string(),
            exempt_paths: vec![],
        });

        // The opaque secret is not a JWT: the federated validator denies it,
        // then the bearer validator accepts it.
        let request = request_with_header("authorization", "Bearer fallback-secret");
        match run_validators(&state, request.headers()).await {
            Attempt::Accepted(identity) => assert_eq!(identity.auth_method, AuthMethod::Bearer),
            _ => panic!("expected bearer fallback to accept"),
        }
    }

    #[test]
    fn unauthorized_response_carries_resource_metadata() {
        let response =
            unauthorized_response("https://gw.example.com/.well-known/oauth-protected-resource");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap();
        assert!(challenge.starts_with("Bearer resource_metadata="));
    }

    #[tokio::test]
    async fn unauthorized_body_never_reveals_the_failing_check() {
        let response =
            unauthorized_response("https://gw.example.com/.well-known/oauth-protected-resource");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Invalid or expired token");
        assert_eq!(body["code"], "INVALID_TOKEN");
    }

    #[tokio::test]
    async fn unavailable_response_reports_retryable_outage() {
        let err = Error::UpstreamUnavailable("jwks fetch timed out".to_string());
        let response = unavailable_response(&err);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "AUTH_UNAVAILABLE");
    }

    #[test]
    fn rate_limited_response_has_standard_headers() {
        let decision = RateLimitDecision {
            allowed: false,
            limit: 10,
            remaining: 0,
            reset_after: std::time::Duration::from_secs(42),
        };
        let response = rate_limited_response(&decision);

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "10");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");
        assert_eq!(headers.get("x-ratelimit-reset").unwrap(), "42");
        assert_eq!(headers.get("retry-after").unwrap(), "42");
    }
}
