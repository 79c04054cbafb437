//! OAuth surface: discovery metadata and the authorization-code exchange.

pub mod codes;
pub mod metadata;

pub use codes::{AuthCodeStore, CodeChallengeMethod, PkceChallenge};
pub use metadata::{
    AuthorizationServerMetadata, ProtectedResourceMetadata, authorization_server_metadata,
    protected_resource_metadata,
};
