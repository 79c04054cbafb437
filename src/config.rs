//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::auth::AuthMode;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    /// Environment files to load before secret resolution.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// Token vault configuration
    pub vault: VaultConfig,
    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
    /// OAuth code-exchange configuration
    pub oauth: OAuthConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Externally visible origin, advertised in discovery metadata.
    /// Defaults to `http://{host}:{port}` when unset.
    pub public_url: Option<String>,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39410,
            public_url: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// The origin advertised in discovery documents and `WWW-Authenticate`.
    #[must_use]
    pub fn public_url(&self) -> String {
        self.public_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port))
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Enable authentication
    pub enabled: bool,

    /// Which validators run: `bearer`, `federated`, or `both`
    pub mode: AuthMode,

    /// Bearer secret for exact-match validation.
    /// Supports a literal value or `env:VAR_NAME` indirection.
    #[serde(default)]
    pub bearer_secret: Option<String>,

    /// Delegate bearer verification to this URL instead of exact match.
    /// HTTP 200 from the endpoint means the token is live.
    #[serde(default)]
    pub bearer_verify_url: Option<String>,

    /// Federated JWT validation
    #[serde(default)]
    pub federated: FederatedConfig,

    /// Paths that bypass authentication
    #[serde(default = "default_exempt_paths")]
    pub exempt_paths: Vec<String>,

    /// Which service's vault credential is attached to authenticated requests
    #[serde(default)]
    pub credential_service: Option<String>,

    /// Which of that service's keys is attached (`api_token` by default)
    #[serde(default = "default_credential_key")]
    pub credential_key: String,
}

fn default_credential_key() -> String {
    crate::vault::DEFAULT_CREDENTIAL_KEY.to_string()
}

// `/token` is exempt because the caller is exchanging a code for its first
// credential; it is rate-limited in the handler instead. `/authorize` is NOT
// exempt: minting a code requires an already-authenticated caller.
fn default_exempt_paths() -> Vec<String> {
    vec![
        "/health".to_string(),
        "/.well-known/".to_string(),
        "/token".to_string(),
    ]
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: AuthMode::default(),
            bearer_secret: None,
            bearer_verify_url: None,
            federated: FederatedConfig::default(),
            exempt_paths: default_exempt_paths(),
            credential_service: None,
            credential_key: default_credential_key(),
        }
    }
}

impl AuthConfig {
    /// Resolve the bearer secret (expand `env:VAR_NAME` indirection)
    #[must_use]
    pub fn resolve_bearer_secret(&self) -> Option<String> {
        self.bearer_secret.as_ref().map(|secret| resolve_env_ref(secret))
    }
}

/// Federated JWT validation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederatedConfig {
    /// Expected issuer URL (exact match against `iss`)
    pub issuer: Option<String>,
    /// Expected audience (exact match against `aud`)
    pub audience: Option<String>,
    /// JWKS endpoint; derived from the issuer when unset
    pub jwks_uri: Option<String>,
    /// Pinned signature algorithm
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
}

fn default_algorithm() -> String {
    "RS256".to_string()
}

impl Default for FederatedConfig {
    fn default() -> Self {
        Self {
            issuer: None,
            audience: None,
            jwks_uri: None,
            algorithm: default_algorithm(),
        }
    }
}

/// Token vault configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Backend: `file` (encrypted, default) or `env` (read-only)
    pub backend: VaultBackend,
    /// Vault directory for the file backend
    pub path: String,
    /// Encryption passphrase for the file backend.
    /// Supports a literal value or `env:VAR_NAME` indirection.
    #[serde(default)]
    pub passphrase: Option<String>,
}

/// Vault backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VaultBackend {
    /// Encrypted JSON files on disk
    #[default]
    File,
    /// Environment variables, read-only
    Env,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            backend: VaultBackend::File,
            path: "~/.mcp-auth-gateway/vault".to_string(),
            passphrase: None,
        }
    }
}

impl VaultConfig {
    /// Resolve the passphrase (expand `env:VAR_NAME` indirection)
    #[must_use]
    pub fn resolve_passphrase(&self) -> Option<String> {
        self.passphrase.as_ref().map(|p| resolve_env_ref(p))
    }

    /// Vault directory with ~ expanded
    #[must_use]
    pub fn expanded_path(&self) -> String {
        expand_tilde(&self.path)
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable per-client rate limiting
    pub enabled: bool,
    /// Requests allowed per window per client
    pub max_requests: u32,
    /// Window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 60,
            window: Duration::from_secs(60),
        }
    }
}

/// OAuth code-exchange configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Authorization code lifetime
    #[serde(with = "humantime_serde")]
    pub code_ttl: Duration,
    /// Scopes advertised in discovery metadata
    pub scopes: Vec<String>,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            code_ttl: Duration::from_secs(300),
            scopes: vec!["mcp".to_string()],
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (`error`..`trace`, or a full `EnvFilter` directive)
    pub level: String,
    /// Output format: `text` or `json`
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable single-line output
    #[default]
    Text,
    /// JSON lines, for log aggregators
    Json,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("AUTH_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Env files go into the process environment before ${VAR} expansion
        // and env: indirection, so secrets can live outside the YAML.
        config.load_env_files();
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Reject configurations that would serve with a hole in them.
    ///
    /// Startup fails outright rather than serving partially authenticated:
    /// a gateway that silently dropped its credential checks is worse than
    /// one that refuses to boot.
    pub fn validate(&self) -> Result<()> {
        if self.auth.enabled {
            let has_bearer = self.auth.bearer_secret.is_some() || self.auth.bearer_verify_url.is_some();
            let has_federated =
                self.auth.federated.issuer.is_some() && self.auth.federated.audience.is_some();

            match self.auth.mode {
                AuthMode::Bearer if !has_bearer => {
                    return Err(Error::Config(
                        "auth.mode is 'bearer' but neither auth.bearer_secret nor auth.bearer_verify_url is set".to_string(),
                    ));
                }
                AuthMode::Federated if !has_federated => {
                    return Err(Error::Config(
                        "auth.mode is 'federated' but auth.federated.issuer and auth.federated.audience are required".to_string(),
                    ));
                }
                AuthMode::Both if !has_bearer && !has_federated => {
                    return Err(Error::Config(
                        "auth.mode is 'both' but no credential source is configured".to_string(),
                    ));
                }
                _ => {}
            }

            // The algorithm string must parse before the first request does.
            crate::auth::jwt::parse_algorithm(&self.auth.federated.algorithm)?;
        }

        if self.vault.backend == VaultBackend::File && self.vault.resolve_passphrase().is_none() {
            return Err(Error::Config(
                "vault.backend is 'file' but vault.passphrase is not set".to_string(),
            ));
        }

        if self.rate_limit.enabled && self.rate_limit.max_requests == 0 {
            return Err(Error::Config(
                "rate_limit.max_requests must be at least 1 when rate limiting is enabled".to_string(),
            ));
        }

        Ok(())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = expand_tilde(path_str);
            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in config values
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        for value in [
            &mut self.auth.bearer_secret,
            &mut self.auth.federated.issuer,
            &mut self.auth.federated.audience,
            &mut self.auth.federated.jwks_uri,
            &mut self.vault.passphrase,
        ]
        .into_iter()
        .flatten()
        {
            *value = Self::expand_string(&re, value);
        }
        self.vault.path = Self::expand_string(&re, &self.vault.path);
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Expand a leading `~` to the home directory.
fn expand_tilde(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.display().to_string(), 1);
        }
    }
    path.to_string()
}

/// Resolve `env:VAR_NAME` indirection, falling back to the literal value.
fn resolve_env_ref(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid_config() -> Config {
        Config {
            auth: AuthConfig {
                bearer_secret: Some("a-perfectly-reasonable-secret".to_string()),
                ..AuthConfig::default()
            },
            vault: VaultConfig {
                passphrase: Some("long enough passphrase for the vault!".to_string()),
                ..VaultConfig::default()
            },
            ..Config::default()
        }
    }

    #[test]
    fn defaults_parse_from_empty_yaml() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.server.port, 39410);
        assert_eq!(config.auth.mode, AuthMode::Bearer);
        assert_eq!(config.auth.credential_key, "api_token");
        assert_eq!(config.rate_limit.max_requests, 60);
        assert!(config.auth.exempt_paths.contains(&"/health".to_string()));
    }

    #[test]
    fn valid_config_passes_validation() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn bearer_mode_without_secret_fails_validation() {
        let mut config = valid_config();
        config.auth.bearer_secret = None;
        config.auth.bearer_verify_url = None;

        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn federated_mode_requires_issuer_and_audience() {
        let mut config = valid_config();
        config.auth.mode = AuthMode::Federated;

        assert!(config.validate().is_err());

        config.auth.federated.issuer = Some("https://idp.example.com".to_string());
        config.auth.federated.audience = Some("https://gw.example.com".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn file_vault_requires_passphrase() {
        let mut config = valid_config();
        config.vault.passphrase = None;

        assert!(config.validate().is_err());

        // The env backend does not need one
        config.vault.backend = VaultBackend::Env;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn symmetric_algorithm_fails_validation() {
        let mut config = valid_config();
        config.auth.federated.algorithm = "HS256".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_rate_limit_fails_validation() {
        let mut config = valid_config();
        config.rate_limit.max_requests = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_ref_indirection_resolves() {
        env::set_var("CONFIG_TEST_SECRET_REF", "resolved-secret");
        let config = Config {
            auth: AuthConfig {
                bearer_secret: Some("env:CONFIG_TEST_SECRET_REF".to_string()),
                ..AuthConfig::default()
            },
            ..Config::default()
        };

        assert_eq!(
            config.auth.resolve_bearer_secret().as_deref(),
            Some("resolved-secret")
        );
    }

    #[test]
    fn env_ref_falls_back_to_literal_when_unset() {
        let config = Config {
            auth: AuthConfig {
                bearer_secret: Some("env:CONFIG_TEST_NO_SUCH_VAR".to_string()),
                ..AuthConfig::default()
            },
            ..Config::default()
        };

        assert_eq!(
            config.auth.resolve_bearer_secret().as_deref(),
            Some("env:CONFIG_TEST_NO_SUCH_VAR")
        );
    }

    #[test]
    fn dollar_brace_expansion_with_default() {
        env::set_var("CONFIG_TEST_EXPAND_VAR", "from-env");
        let mut config = Config {
            auth: AuthConfig {
                bearer_secret: Some("${CONFIG_TEST_EXPAND_VAR}".to_string()),
                ..AuthConfig::default()
            },
            vault: VaultConfig {
                path: "${CONFIG_TEST_EXPAND_MISSING:-/tmp/vault}".to_string(),
                ..VaultConfig::default()
            },
            ..Config::default()
        };
        config.expand_env_vars();

        assert_eq!(config.auth.bearer_secret.as_deref(), Some("from-env"));
        assert_eq!(config.vault.path, "/tmp/vault");
    }

    #[test]
    fn load_env_files_sets_env_vars() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("test.env");
        let mut f = std::fs::File::create(&env_path).unwrap();
        writeln!(f, "AUTH_GW_TEST_KEY_A=hello_from_env_file").unwrap();
        drop(f);

        let config = Config {
            env_files: vec![env_path.to_string_lossy().to_string()],
            ..Default::default()
        };
        config.load_env_files();

        assert_eq!(env::var("AUTH_GW_TEST_KEY_A").unwrap(), "hello_from_env_file");
    }

    #[test]
    fn load_env_files_skips_missing() {
        let config = Config {
            env_files: vec!["/nonexistent/path/.env".to_string()],
            ..Default::default()
        };
        // Should not panic
        config.load_env_files();
    }

    #[test]
    fn durations_parse_human_suffixes() {
        let yaml = r"
rate_limit:
  window: 5m
server:
  timeout: 1500ms
oauth:
  code_ttl: 300s
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.rate_limit.window, Duration::from_secs(300));
        assert_eq!(config.server.timeout, Duration::from_millis(1500));
        assert_eq!(config.oauth.code_ttl, Duration::from_secs(300));
    }

    #[test]
    fn public_url_defaults_to_bind_address() {
        let config = Config::default();
        assert_eq!(config.server.public_url(), "http://127.0.0.1:39410");

        let explicit = Config {
            server: ServerConfig {
                public_url: Some("https://gw.example.com".to_string()),
                ..ServerConfig::default()
            },
            ..Config::default()
        };
        assert_eq!(explicit.server.public_url(), "https://gw.example.com");
    }
}
