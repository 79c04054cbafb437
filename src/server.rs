//! Gateway HTTP server.
//!
//! Route map:
//!
//! | Route | Auth | Purpose |
//! |-------|------|---------|
//! | `GET /health` | none | Liveness |
//! | `GET /.well-known/oauth-authorization-server` | none | RFC 8414 metadata |
//! | `GET /.well-known/oauth-protected-resource` | none | RFC 9728 metadata |
//! | `GET /.well-known/jwks.json` | none | Upstream JWKS proxy |
//! | `POST /authorize` | required | Mint an authorization code |
//! | `POST /token` | none (rate-limited) | Exchange a code for a credential |
//! | `GET /whoami` | required | Echo the resolved identity |

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Extension, Form, Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use crate::auth::middleware::{AuthState, auth_middleware};
use crate::auth::{
    AuthMode, AuthenticatedIdentity, BearerPolicy, BearerValidator, JwtValidator,
    JwtValidatorConfig, RateLimiter,
};
use crate::config::{Config, VaultBackend};
use crate::oauth::{
    AuthCodeStore, CodeChallengeMethod, PkceChallenge, authorization_server_metadata,
    protected_resource_metadata,
};
use crate::vault::{EnvVault, FileVault, TokenVault};
use crate::{Error, Result};

/// Shared state for the route handlers.
pub struct AppState {
    /// Outstanding authorization codes.
    pub code_store: Arc<AuthCodeStore>,
    /// Credential vault, absent when no backend is usable.
    pub vault: Option<Arc<dyn TokenVault>>,
    /// Federated validator, for the JWKS proxy.
    pub federated: Option<Arc<JwtValidator>>,
    /// Rate limiter shared with the middleware; `/token` enforces it here
    /// because the path is auth-exempt.
    pub rate_limiter: Option<Arc<RateLimiter>>,
    /// Externally visible origin.
    pub public_url: String,
    /// Scopes advertised in discovery metadata.
    pub scopes: Vec<String>,
    /// Advertised code lifetime, for `expires_in`.
    pub code_ttl_secs: u64,
}

/// The auth gateway server.
pub struct AuthGateway {
    config: Config,
}

impl AuthGateway {
    /// Create a gateway from validated configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the gateway until a shutdown signal arrives.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        let vault = build_vault(&self.config)?;
        let federated = build_federated(&self.config)?;
        let rate_limiter = if self.config.rate_limit.enabled {
            Some(Arc::new(RateLimiter::new(
                self.config.rate_limit.max_requests,
                self.config.rate_limit.window,
            )))
        } else {
            None
        };
        let code_store = Arc::new(AuthCodeStore::with_ttl(self.config.oauth.code_ttl));

        // Background sweepers keep the in-memory maps bounded.
        if let Some(ref limiter) = rate_limiter {
            Arc::clone(limiter).spawn_sweeper(shutdown_tx.subscribe());
        }
        Arc::clone(&code_store).spawn_sweeper(shutdown_tx.subscribe());

        let public_url = self.config.server.public_url();
        let auth_state = Arc::new(AuthState {
            mode: self.config.auth.mode,
            bearer: build_bearer(&self.config),
            federated: federated.clone(),
            rate_limiter: rate_limiter.clone(),
            vault: vault.clone(),
            credential_service: self.config.auth.credential_service.clone(),
            credential_key: self.config.auth.credential_key.clone(),
            resource_metadata_url: format!("{public_url}/.well-known/oauth-protected-resource"),
            exempt_paths: self.config.auth.exempt_paths.clone(),
        });

        let state = Arc::new(AppState {
            code_store,
            vault,
            federated,
            rate_limiter,
            public_url,
            scopes: self.config.oauth.scopes.clone(),
            code_ttl_secs: self.config.oauth.code_ttl.as_secs(),
        });

        let app = create_router(state, auth_state, self.config.auth.enabled);

        let listener = TcpListener::bind(addr).await?;

        info!("MCP AUTH GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!(host = %self.config.server.host, port = self.config.server.port, "Listening");
        if self.config.auth.enabled {
            info!(mode = ?self.config.auth.mode, "AUTHENTICATION enabled");
        } else {
            warn!("AUTHENTICATION disabled - gateway is open to all requests");
        }

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Shutdown complete");
        Ok(())
    }
}

/// Build the router; auth middleware is attached unless disabled outright.
pub fn create_router(
    state: Arc<AppState>,
    auth_state: Arc<AuthState>,
    auth_enabled: bool,
) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route(
            "/.well-known/oauth-authorization-server",
            get(authorization_server_doc),
        )
        .route(
            "/.well-known/oauth-protected-resource",
            get(protected_resource_doc),
        )
        .route("/.well-known/jwks.json", get(jwks_proxy))
        .route("/authorize", post(authorize))
        .route("/token", post(token))
        .route("/whoami", get(whoami));

    if auth_enabled {
        router = router.layer(from_fn_with_state(auth_state, auth_middleware));
    }

    router
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

fn build_vault(config: &Config) -> Result<Option<Arc<dyn TokenVault>>> {
    match config.vault.backend {
        VaultBackend::Env => Ok(Some(Arc::new(EnvVault::new()))),
        VaultBackend::File => {
            let Some(passphrase) = config.vault.resolve_passphrase() else {
                // validate() rejects this combination; belt and braces.
                return Ok(None);
            };
            let vault = FileVault::open(config.vault.expanded_path(), &passphrase)?;
            Ok(Some(Arc::new(vault)))
        }
    }
}

fn build_bearer(config: &Config) -> Option<BearerValidator> {
    if !matches!(config.auth.mode, AuthMode::Bearer | AuthMode::Both) {
        return None;
    }

    if let Some(verify_url) = config.auth.bearer_verify_url.clone() {
        return Some(BearerValidator::new(BearerPolicy::Remote { verify_url }));
    }
    config
        .auth
        .resolve_bearer_secret()
        .map(|secret| BearerValidator::new(BearerPolicy::Exact { secret }))
}

fn build_federated(config: &Config) -> Result<Option<Arc<JwtValidator>>> {
    if !matches!(config.auth.mode, AuthMode::Federated | AuthMode::Both) {
        return Ok(None);
    }

    let (Some(issuer), Some(audience)) = (
        config.auth.federated.issuer.clone(),
        config.auth.federated.audience.clone(),
    ) else {
        return Ok(None);
    };

    Ok(Some(Arc::new(JwtValidator::new(JwtValidatorConfig {
        issuer,
        audience,
        jwks_uri: config.auth.federated.jwks_uri.clone(),
        algorithm: crate::auth::jwt::parse_algorithm(&config.auth.federated.algorithm)?,
    }))))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn authorization_server_doc(State(state): State<Arc<AppState>>) -> Response {
    Json(authorization_server_metadata(&state.public_url, &state.scopes)).into_response()
}

async fn protected_resource_doc(State(state): State<Arc<AppState>>) -> Response {
    Json(protected_resource_metadata(&state.public_url, &state.scopes)).into_response()
}

/// Proxy the upstream IdP's JWKS so clients only ever talk to the gateway.
async fn jwks_proxy(State(state): State<Arc<AppState>>) -> Response {
    let Some(ref validator) = state.federated else {
        // No federated issuer configured: an empty key set, not an error.
        return Json(json!({ "keys": [] })).into_response();
    };

    match validator.upstream_jwks().await {
        Ok(doc) => Json(doc).into_response(),
        Err(e) => {
            warn!(error = %e, "JWKS proxy fetch failed");
            let err = Error::from(e);
            error_response(err.status_code(), "upstream key server unavailable", err.code())
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthorizeRequest {
    /// Which stored credential the code will redeem for.
    service: String,
    /// Which of the service's keys; `api_token` when omitted.
    key: Option<String>,
    code_challenge: Option<String>,
    code_challenge_method: Option<CodeChallengeMethod>,
}

/// Mint an authorization code for a stored service credential.
///
/// The middleware has already authenticated the caller; the identity
/// extension is only absent when auth is disabled outright.
async fn authorize(
    State(state): State<Arc<AppState>>,
    identity: Option<Extension<AuthenticatedIdentity>>,
    Json(request): Json<AuthorizeRequest>,
) -> Response {
    let Some(ref vault) = state.vault else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "no credential vault configured",
            "VAULT_UNAVAILABLE",
        );
    };

    let key = request
        .key
        .as_deref()
        .unwrap_or(crate::vault::DEFAULT_CREDENTIAL_KEY);
    let credential = match vault.get_token(&request.service, key).await {
        Ok(Some(value)) => value,
        Ok(None) => {
            return error_response(
                StatusCode::NOT_FOUND,
                "no stored credential for service",
                "UNKNOWN_SERVICE",
            );
        }
        Err(e) => {
            warn!(service = %request.service, key = %key, error = %e, "Vault read failed during authorize");
            return error_response(e.status_code(), "credential vault unavailable", e.code());
        }
    };

    let pkce = request.code_challenge.map(|challenge| PkceChallenge {
        challenge,
        // RFC 7636: S256 is the default when a challenge is sent without a method
        method: request
            .code_challenge_method
            .unwrap_or(CodeChallengeMethod::S256),
    });

    if let Some(Extension(identity)) = identity {
        info!(subject = %identity.subject, service = %request.service, "Issuing authorization code");
    }

    let code = state
        .code_store
        .create_code(&request.service, &credential, pkce);

    (
        StatusCode::OK,
        Json(json!({
            "code": code,
            "expires_in": state.code_ttl_secs,
        })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct TokenRequest {
    grant_type: String,
    code: String,
    code_verifier: Option<String>,
}

/// Exchange an authorization code for its backing credential.
///
/// Auth-exempt (the caller has nothing to authenticate with yet), so the
/// rate limiter is enforced here rather than in the middleware.
async fn token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(request): Form<TokenRequest>,
) -> Response {
    if let Some(ref limiter) = state.rate_limiter {
        let client_key = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map_or_else(|| "direct".to_string(), |ip| ip.trim().to_string());

        let decision = limiter.check_and_record(&client_key);
        if !decision.allowed {
            let err = Error::RateLimitExceeded {
                retry_after_secs: decision.retry_after_secs(),
            };
            return (
                err.status_code(),
                [("retry-after", decision.retry_after_secs().to_string())],
                Json(json!({
                    "error": "too many token requests",
                    "code": err.code(),
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                })),
            )
                .into_response();
        }
    }

    if request.grant_type != "authorization_code" {
        return error_response(
            StatusCode::BAD_REQUEST,
            "unsupported grant_type",
            "unsupported_grant_type",
        );
    }

    // All redemption failures collapse to the same answer; the audit log
    // keeps the real reason server-side.
    match state
        .code_store
        .exchange_code(&request.code, request.code_verifier.as_deref())
    {
        Some(credential) => (
            StatusCode::OK,
            Json(json!({
                "access_token": credential,
                "token_type": "Bearer",
            })),
        )
            .into_response(),
        None => {
            let err = Error::CodeRedemption;
            error_response(
                err.status_code(),
                "invalid, expired, or already used authorization code",
                err.code(),
            )
        }
    }
}

/// Echo the identity the middleware resolved. The minimal protected route.
async fn whoami(identity: Option<Extension<AuthenticatedIdentity>>) -> Response {
    match identity {
        Some(Extension(identity)) => Json(identity).into_response(),
        // Only reachable with auth disabled
        None => Json(json!({ "subject": "anonymous" })).into_response(),
    }
}

fn error_response(status: StatusCode, message: &str, code: &str) -> Response {
    (
        status,
        Json(json!({
            "error": message,
            "code": code,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
        .into_response()
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            warn!("Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, FederatedConfig};

    #[test]
    fn bearer_policy_prefers_remote_verification() {
        let config = Config {
            auth: AuthConfig {
                bearer_secret: Some("secret".to_string()),
                bearer_verify_url: Some("https://api.example.com/whoami".to_string()),
                ..AuthConfig::default()
            },
            ..Config::default()
        };

        // Remote wins when both are configured
        assert!(build_bearer(&config).is_some());
    }

    #[test]
    fn federated_mode_without_issuer_builds_no_validator() {
        let config = Config {
            auth: AuthConfig {
                mode: AuthMode::Federated,
                ..AuthConfig::default()
            },
            ..Config::default()
        };

        assert!(build_federated(&config).unwrap().is_none());
    }

    #[test]
    fn federated_validator_builds_from_full_config() {
        let config = Config {
            auth: AuthConfig {
                mode: AuthMode::Federated,
                federated: FederatedConfig {
                    issuer: Some("https://idp.example.com".to_string()),
                    audience: Some("https://gw.example.com".to_string()),
                    jwks_uri: None,
                    algorithm: "ES256".to_string(),
                },
                ..AuthConfig::default()
            },
            ..Config::default()
        };

        assert!(build_federated(&config).unwrap().is_some());
    }

    #[test]
    fn bearer_mode_never_builds_federated() {
        let config = Config {
            auth: AuthConfig {
                mode: AuthMode::Bearer,
                federated: FederatedConfig {
                    issuer: Some("https://idp.example.com".to_string()),
                    audience: Some("aud".to_string()),
                    ..FederatedConfig::default()
                },
                ..AuthConfig::default()
            },
            ..Config::default()
        };

        assert!(build_federated(&config).unwrap().is_none());
    }
}

