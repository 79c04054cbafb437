//! Read-only vault backed by environment variables.
//!
//! Secrets are looked up as `<PREFIX><SERVICE>_<KEY>` with both names
//! upper-cased and dashes mapped to underscores (`("coda-docs",
//! "api_token")` becomes `AUTH_GATEWAY_TOKEN_CODA_DOCS_API_TOKEN`). The
//! platform owns the secret lifecycle, so every mutating operation is a
//! configuration error.

use async_trait::async_trait;
use tracing::debug;

use super::TokenVault;
use crate::{Error, Result};

/// Default environment variable prefix.
const DEFAULT_PREFIX: &str = "AUTH_GATEWAY_TOKEN_";

/// Environment-variable vault.
pub struct EnvVault {
    prefix: String,
}

impl EnvVault {
    /// Create a vault with the default `AUTH_GATEWAY_TOKEN_` prefix.
    #[must_use]
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_PREFIX)
    }

    /// Create a vault with a custom variable prefix.
    #[must_use]
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn var_name(&self, service: &str, key: &str) -> String {
        let service = service.to_uppercase().replace('-', "_");
        let key = key.to_uppercase().replace('-', "_");
        format!("{}{service}_{key}", self.prefix)
    }

    fn read_only_error(operation: &str) -> Error {
        Error::Config(format!(
            "the env vault is read-only: {operation} must be done through the deployment platform"
        ))
    }
}

impl Default for EnvVault {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenVault for EnvVault {
    async fn get_token(&self, service: &str, key: &str) -> Result<Option<String>> {
        let name = self.var_name(service, key);
        match std::env::var(&name) {
            Ok(value) if !value.is_empty() => Ok(Some(value)),
            _ => {
                debug!(service = %service, key = %key, var = %name, "No credential in environment");
                Ok(None)
            }
        }
    }

    async fn set_token(&self, _service: &str, _key: &str, _value: &str) -> Result<()> {
        Err(Self::read_only_error("set"))
    }

    async fn delete_token(&self, _service: &str, _key: &str) -> Result<()> {
        Err(Self::read_only_error("delete"))
    }

    /// List the `SERVICE_KEY` entry names found in the environment.
    ///
    /// The variable naming cannot say where the service ends and the key
    /// begins, so entries are reported as found rather than split.
    async fn list_services(&self) -> Result<Vec<String>> {
        let mut services: Vec<String> = std::env::vars()
            .filter_map(|(name, _)| {
                name.strip_prefix(&self.prefix)
                    .map(|s| s.to_lowercase().replace('_', "-"))
            })
            .collect();
        services.sort();
        Ok(services)
    }

    async fn rotate_key(&self, _old: &str, _new: &str) -> Result<usize> {
        Err(Self::read_only_error("key rotation"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_prefixed_variable() {
        // Prefix unique to this test to dodge process-wide env races
        let vault = EnvVault::with_prefix("ENV_VAULT_TEST_A_");
        std::env::set_var("ENV_VAULT_TEST_A_CODA_API_TOKEN", "from-env");

        assert_eq!(
            vault.get_token("coda", "api_token").await.unwrap().as_deref(),
            Some("from-env")
        );
    }

    #[tokio::test]
    async fn dashes_map_to_underscores_in_both_names() {
        let vault = EnvVault::with_prefix("ENV_VAULT_TEST_B_");
        std::env::set_var("ENV_VAULT_TEST_B_CODA_DOCS_API_TOKEN", "x");

        assert_eq!(
            vault
                .get_token("coda-docs", "api-token")
                .await
                .unwrap()
                .as_deref(),
            Some("x")
        );
    }

    #[tokio::test]
    async fn absent_and_empty_variables_are_none() {
        let vault = EnvVault::with_prefix("ENV_VAULT_TEST_C_");
        std::env::set_var("ENV_VAULT_TEST_C_EMPTY_API_TOKEN", "");

        assert_eq!(vault.get_token("missing", "api_token").await.unwrap(), None);
        assert_eq!(vault.get_token("empty", "api_token").await.unwrap(), None);
    }

    #[tokio::test]
    async fn mutations_are_config_errors() {
        let vault = EnvVault::new();

        assert!(matches!(
            vault.set_token("coda", "api_token", "x").await,
            Err(Error::Config(_))
        ));
        assert!(matches!(
            vault.delete_token("coda", "api_token").await,
            Err(Error::Config(_))
        ));
        assert!(matches!(
            vault.rotate_key("a", "b").await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn list_services_reports_found_entries() {
        let vault = EnvVault::with_prefix("ENV_VAULT_TEST_D_");
        std::env::set_var("ENV_VAULT_TEST_D_GITHUB_API_TOKEN", "x");
        std::env::set_var("ENV_VAULT_TEST_D_CODA_API_TOKEN", "y");

        let services = vault.list_services().await.unwrap();
        assert!(services.contains(&"github-api-token".to_string()));
        assert!(services.contains(&"coda-api-token".to_string()));
    }
}
