//! MCP Auth Gateway - authentication and authorization for MCP servers.

use std::io::Read;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use mcp_auth_gateway::{
    cli::{Cli, Command, VaultCommand},
    config::{Config, VaultBackend},
    crypto,
    server::AuthGateway,
    setup_tracing,
    vault::{FileVault, TokenVault},
};

#[tokio::main]
async fn main() -> ExitCode {
    let mut cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command.take() {
        Some(Command::GenKey) => {
            println!("{}", crypto::generate_key());
            ExitCode::SUCCESS
        }
        Some(Command::Vault(vault_cmd)) => run_vault_command(&cli, vault_cmd).await,
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Load config with CLI overrides applied.
fn load_config(cli: &Cli) -> Option<Config> {
    match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            Some(config)
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            None
        }
    }
}

/// Open the file vault named in config for offline management commands.
fn open_file_vault(config: &Config) -> Option<FileVault> {
    if config.vault.backend != VaultBackend::File {
        eprintln!("Vault commands require vault.backend = \"file\"");
        return None;
    }
    let Some(passphrase) = config.vault.resolve_passphrase() else {
        eprintln!("vault.passphrase is not set");
        return None;
    };

    match FileVault::open(config.vault.expanded_path(), &passphrase) {
        Ok(vault) => Some(vault),
        Err(e) => {
            eprintln!("Failed to open vault: {e}");
            None
        }
    }
}

/// Run vault management commands
async fn run_vault_command(cli: &Cli, cmd: VaultCommand) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };
    let Some(vault) = open_file_vault(&config) else {
        return ExitCode::FAILURE;
    };

    match cmd {
        VaultCommand::Set { service, key, value } => {
            let value = match value {
                Some(v) => v,
                None => {
                    let mut buf = String::new();
                    if std::io::stdin().read_to_string(&mut buf).is_err() {
                        eprintln!("Failed to read credential from stdin");
                        return ExitCode::FAILURE;
                    }
                    buf.trim_end_matches('\n').to_string()
                }
            };

            match vault.set_token(&service, &key, &value).await {
                Ok(()) => {
                    println!("Stored '{key}' credential for '{service}'");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Failed to store credential: {e}");
                    ExitCode::FAILURE
                }
            }
        }

        VaultCommand::List => match vault.list_services().await {
            Ok(services) => {
                if services.is_empty() {
                    println!("Vault is empty");
                } else {
                    for service in services {
                        println!("{service}");
                    }
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Failed to list services: {e}");
                ExitCode::FAILURE
            }
        },

        VaultCommand::Delete { service, key } => match vault.delete_token(&service, &key).await {
            Ok(()) => {
                println!("Deleted '{key}' credential for '{service}'");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Failed to delete credential: {e}");
                ExitCode::FAILURE
            }
        },

        VaultCommand::RotateKey { old, new } => {
            let old = resolve_env_ref(&old);
            let new = resolve_env_ref(&new);

            match vault.rotate_key(&old, &new).await {
                Ok(rotated) => {
                    println!("Rotated {rotated} credential(s) to the new key");
                    println!("Update vault.passphrase before the next restart");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Key rotation failed: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

/// Resolve `env:VAR_NAME` references in CLI-provided passphrases.
fn resolve_env_ref(value: &str) -> String {
    value
        .strip_prefix("env:")
        .and_then(|name| std::env::var(name).ok())
        .unwrap_or_else(|| value.to_string())
}

/// Run the gateway server
async fn run_server(cli: Cli) -> ExitCode {
    let Some(config) = load_config(&cli) else {
        return ExitCode::FAILURE;
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        mode = ?config.auth.mode,
        "Starting MCP Auth Gateway"
    );

    if let Err(e) = AuthGateway::new(config).run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
