//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Authentication and authorization gateway for MCP servers
#[derive(Parser, Debug)]
#[command(name = "mcp-auth-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "AUTH_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "AUTH_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "AUTH_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "AUTH_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "AUTH_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Generate a strong random vault passphrase
    GenKey,

    /// Vault management commands
    #[command(subcommand)]
    Vault(VaultCommand),
}

/// Vault subcommands
#[derive(Subcommand, Debug)]
pub enum VaultCommand {
    /// Store a credential for a service
    Set {
        /// Service name (e.g. "coda")
        #[arg(required = true)]
        service: String,

        /// Credential key within the service (e.g. "webhook_secret")
        #[arg(long, default_value = "api_token")]
        key: String,

        /// Credential value; reads from stdin when omitted
        #[arg(long)]
        value: Option<String>,
    },

    /// List services with a stored credential
    List,

    /// Delete a stored credential
    Delete {
        /// Service name
        #[arg(required = true)]
        service: String,

        /// Credential key within the service
        #[arg(long, default_value = "api_token")]
        key: String,
    },

    /// Re-encrypt every stored credential under a new passphrase
    RotateKey {
        /// Current passphrase (supports "env:VAR_NAME")
        #[arg(long, required = true)]
        old: String,

        /// New passphrase (supports "env:VAR_NAME")
        #[arg(long, required = true)]
        new: String,
    },
}
