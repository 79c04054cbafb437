//! Encrypted storage for downstream service credentials.
//!
//! A [`TokenVault`] maps a `(service, key)` pair to one secret value: the
//! service names the downstream API (e.g. `"coda"`, `"github"`) and the key
//! names the logical credential within it (e.g. `"api_token"`,
//! `"webhook_secret"`). Two backends exist:
//!
//! - [`FileVault`]: one AES-256-GCM-encrypted JSON file per record, with
//!   key rotation support. The production backend.
//! - [`EnvVault`]: plaintext values from environment variables, read-only.
//!   For containerized deployments where the platform injects secrets.
//!
//! Plaintext secrets exist only in the return values of `get_token`; what
//! hits disk is always the encrypted record.

use async_trait::async_trait;

use crate::Result;

mod env;
mod file;

pub use env::EnvVault;
pub use file::FileVault;

/// The conventional key for a service's primary credential.
pub const DEFAULT_CREDENTIAL_KEY: &str = "api_token";

/// Backend-agnostic credential store.
#[async_trait]
pub trait TokenVault: Send + Sync {
    /// Fetch and decrypt the secret stored under `(service, key)`.
    /// `Ok(None)` when absent.
    async fn get_token(&self, service: &str, key: &str) -> Result<Option<String>>;

    /// Encrypt and persist a secret under `(service, key)`, replacing any
    /// existing one (last write wins).
    async fn set_token(&self, service: &str, key: &str, value: &str) -> Result<()>;

    /// Remove the secret stored under `(service, key)`. Absent is not an
    /// error.
    async fn delete_token(&self, service: &str, key: &str) -> Result<()>;

    /// Service names with at least one stored secret.
    async fn list_services(&self) -> Result<Vec<String>>;

    /// Re-encrypt every record from `old_passphrase` to `new_passphrase`.
    ///
    /// Records that fail to decrypt under the old key are skipped, not
    /// fatal: one corrupt record must not strand the rest on the old key.
    /// Returns the number of records successfully rotated.
    async fn rotate_key(&self, old_passphrase: &str, new_passphrase: &str) -> Result<usize>;
}
