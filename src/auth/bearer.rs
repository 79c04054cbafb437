//! Bearer token validation — header parsing and acceptance policy.
//!
//! Parsing and verification fail differently on purpose: a header that does
//! not even look like `Bearer <token>` is [`BearerError::Malformed`], while a
//! well-formed token the policy refuses is [`BearerError::Rejected`]. Both
//! collapse to 401 at the edge, but the audit log keeps the distinction.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::debug;

/// Timeout for delegated verification calls to the resource API.
const REMOTE_VERIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Error variants for bearer validation failures.
#[derive(Debug, Error)]
pub enum BearerError {
    /// Header absent, wrong scheme, or token outside the allowed charset.
    #[error("malformed authorization header: {0}")]
    Malformed(&'static str),

    /// Well-formed token that the configured policy refused.
    #[error("token rejected by {0} policy")]
    Rejected(&'static str),

    /// Delegated verification could not reach the resource API. This is an
    /// infrastructure failure, not a credential failure.
    #[error("delegated verification unavailable: {0}")]
    Upstream(String),
}

impl From<BearerError> for crate::Error {
    fn from(err: BearerError) -> Self {
        match err {
            BearerError::Upstream(reason) => Self::UpstreamUnavailable(reason),
            e @ BearerError::Malformed(_) => Self::MalformedCredential(e.to_string()),
            e @ BearerError::Rejected(_) => Self::InvalidCredential(e.to_string()),
        }
    }
}

/// RFC 6750 token68-ish charset: alphanumeric plus `-._~+/=`.
fn token_charset() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::unwrap_used)]
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9\-._~+/=]+$").unwrap())
}

/// Parse an `Authorization` header value into its bearer token.
///
/// Requires the literal `Bearer ` scheme (case-sensitive per the observed
/// clients) and a token drawn entirely from the restricted charset.
pub fn parse_bearer_header(header: &str) -> Result<&str, BearerError> {
    let token = header
        .strip_prefix("Bearer ")
        .ok_or(BearerError::Malformed("expected 'Bearer ' scheme"))?;

    if token.is_empty() {
        return Err(BearerError::Malformed("empty token"));
    }
    if !token_charset().is_match(token) {
        return Err(BearerError::Malformed("token contains invalid characters"));
    }

    Ok(token)
}

/// How presented bearer tokens are accepted.
#[derive(Debug, Clone)]
pub enum BearerPolicy {
    /// Exact match against one configured secret (constant-time compare).
    Exact {
        /// The configured secret.
        secret: String,
    },
    /// Delegate to the protected API's own "who am I" endpoint: HTTP 200
    /// means the token is live.
    Remote {
        /// Verification endpoint, called with the presented token.
        verify_url: String,
    },
    /// Accept any well-formed token. Local development only; this variant
    /// does not exist in default builds.
    #[cfg(feature = "dev-insecure")]
    AcceptAny,
}

/// Bearer token validator holding the acceptance policy.
pub struct BearerValidator {
    policy: BearerPolicy,
    http: reqwest::Client,
}

impl BearerValidator {
    /// Create a validator for the given policy.
    #[must_use]
    pub fn new(policy: BearerPolicy) -> Self {
        Self {
            policy,
            http: reqwest::Client::builder()
                .timeout(REMOTE_VERIFY_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Parse the header and evaluate the policy, returning the accepted token.
    pub async fn validate<'a>(&self, header: &'a str) -> Result<&'a str, BearerError> {
        let token = parse_bearer_header(header)?;

        match &self.policy {
            BearerPolicy::Exact { secret } => {
                // Constant-time comparison to prevent timing side-channels
                let matches: bool = token.as_bytes().ct_eq(secret.as_bytes()).into();
                if matches {
                    Ok(token)
                } else {
                    Err(BearerError::Rejected("exact-match"))
                }
            }
            BearerPolicy::Remote { verify_url } => {
                debug!(url = %verify_url, "Delegating bearer verification");
                let response = self
                    .http
                    .get(verify_url)
                    .bearer_auth(token)
                    .send()
                    .await
                    .map_err(|e| BearerError::Upstream(e.to_string()))?;

                if response.status().is_success() {
                    Ok(token)
                } else {
                    Err(BearerError::Rejected("remote"))
                }
            }
            #[cfg(feature = "dev-insecure")]
            BearerPolicy::AcceptAny => Ok(token),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_valid_token() {
        let token = parse_bearer_header("Bearer abc123-._~+/=").unwrap();
        assert_eq!(token, "abc123-._~+/=");
    }

    #[test]
    fn parse_rejects_missing_scheme() {
        assert!(matches!(
            parse_bearer_header("abc123"),
            Err(BearerError::Malformed(_))
        ));
    }

    #[test]
    fn parse_rejects_lowercase_scheme() {
        assert!(matches!(
            parse_bearer_header("bearer abc123"),
            Err(BearerError::Malformed(_))
        ));
    }

    #[test]
    fn parse_rejects_empty_token() {
        assert!(matches!(
            parse_bearer_header("Bearer "),
            Err(BearerError::Malformed(_))
        ));
    }

    #[test]
    fn parse_rejects_invalid_characters() {
        assert!(matches!(
            parse_bearer_header("Bearer has spaces"),
            Err(BearerError::Malformed(_))
        ));
        assert!(matches!(
            parse_bearer_header("Bearer émoji"),
            Err(BearerError::Malformed(_))
        ));
        assert!(matches!(
            parse_bearer_header("Bearer semi;colon"),
            Err(BearerError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn exact_policy_accepts_matching_secret() {
        let validator = BearerValidator::new(BearerPolicy::Exact {
            secret: "expected-token".to_string(),
        });

        let token = validator.validate("Bearer expected-token").await.unwrap();
        assert_eq!(token, "expected-token");
    }

    #[tokio::test]
    async fn exact_policy_rejects_wrong_secret() {
        let validator = BearerValidator::new(BearerPolicy::Exact {
            secret: "expected-token".to_string(),
        });

        let result = validator.validate("Bearer not-a-real-token").await;
        assert!(matches!(result, Err(BearerError::Rejected("exact-match"))));
    }

    #[tokio::test]
    async fn exact_policy_rejects_prefix_of_secret() {
        let validator = BearerValidator::new(BearerPolicy::Exact {
            secret: "expected-token".to_string(),
        });

        // ct_eq over different lengths must not match
        let result = validator.validate("Bearer expected").await;
        assert!(matches!(result, Err(BearerError::Rejected(_))));
    }

    #[tokio::test]
    async fn malformed_header_never_reaches_policy() {
        let validator = BearerValidator::new(BearerPolicy::Exact {
            secret: "whatever".to_string(),
        });

        // Malformed, not Rejected: parsing fails before the policy runs
        let result = validator.validate("Basic dXNlcjpwYXNz").await;
        assert!(matches!(result, Err(BearerError::Malformed(_))));
    }

    #[test]
    fn failures_map_into_the_error_taxonomy() {
        use axum::http::StatusCode;

        let malformed = crate::Error::from(BearerError::Malformed("empty token"));
        assert!(matches!(malformed, crate::Error::MalformedCredential(_)));
        assert_eq!(malformed.status_code(), StatusCode::UNAUTHORIZED);

        let rejected = crate::Error::from(BearerError::Rejected("exact-match"));
        assert!(matches!(rejected, crate::Error::InvalidCredential(_)));

        // Upstream failure must not collapse into a credential failure
        let upstream = crate::Error::from(BearerError::Upstream("timeout".into()));
        assert_eq!(upstream.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(upstream.is_retryable());
    }

    #[cfg(feature = "dev-insecure")]
    #[tokio::test]
    async fn accept_any_still_requires_well_formed_token() {
        let validator = BearerValidator::new(BearerPolicy::AcceptAny);

        assert!(validator.validate("Bearer anything-goes").await.is_ok());
        assert!(matches!(
            validator.validate("Bearer bad token").await,
            Err(BearerError::Malformed(_))
        ));
    }
}
