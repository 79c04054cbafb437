//! Authentication and authorization for the gateway.
//!
//! The middleware in [`middleware`] orchestrates the individual validators:
//! opaque bearer secrets ([`bearer`]), federated JWTs verified against an
//! IdP's JWKS ([`jwt`]), with per-client rate limiting ([`rate_limit`]) and
//! a structured audit trail ([`audit`]) around every decision.

pub mod audit;
pub mod bearer;
pub mod identity;
pub mod jwt;
pub mod middleware;
pub mod rate_limit;

pub use bearer::{BearerPolicy, BearerValidator};
pub use identity::{AuthMethod, AuthenticatedIdentity, ServiceCredential};
pub use jwt::{JwtValidator, JwtValidatorConfig, JwksCache};
pub use middleware::{AuthMode, AuthState, auth_middleware};
pub use rate_limit::{RateLimitDecision, RateLimiter};
