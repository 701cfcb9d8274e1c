use super::models::Config;
use config::{ConfigError, Environment, File};
use std::env;
use std::path::PathBuf;

const CONFIG_ENV_VAR: &str = "MIRRORBOX_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/mirrorbox.toml";
const ENV_PREFIX: &str = "MIRRORBOX";
const ENV_SEPARATOR: &str = "__";

/// Load configuration from multiple sources with priority:
/// 1. Defaults (embedded in structs)
/// 2. TOML file (if exists)
/// 3. Environment variables from .env file (via dotenvy)
/// 4. System environment variables (highest priority)
pub fn load() -> Result<Config, ConfigError> {
    let _ = dotenvy::dotenv();

    let config_path = env::var(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut config = load_from_sources(config_path)?;
    load_secrets(&mut config, |key| env::var(key).ok());

    Ok(config)
}

/// Secrets are never stored in TOML files, only in environment
fn load_secrets(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(secret) = lookup("MIRRORBOX_RPC_SECRET") {
        config.daemon.rpc_secret = Some(secret);
    }
    if let Some(token) = lookup("MIRRORBOX_DRIVE_TOKEN") {
        config.storage.drive_token = Some(token);
    }

    config.storage.access_key = lookup("S3_ACCESS_KEY").or_else(|| lookup("AWS_ACCESS_KEY_ID"));
    config.storage.secret_key =
        lookup("S3_SECRET_KEY").or_else(|| lookup("AWS_SECRET_ACCESS_KEY"));
}

/// Load configuration from a specific path and environment
pub fn load_from_sources(config_path: PathBuf) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();

    if config_path.exists() {
        tracing::info!("Loading configuration from: {}", config_path.display());
        builder = builder.add_source(File::from(config_path).required(false));
    } else {
        tracing::warn!(
            "Configuration file not found at {}, using defaults and environment overrides",
            config_path.display()
        );
    }

    // MIRRORBOX__DAEMON__RPC_PORT -> daemon.rpc_port
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize()
}
