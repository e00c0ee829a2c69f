//! Startup configuration loading from file and environment variables.

use serde::Deserialize;
use tessera_db::{DatabaseConfig, Environment};
use thiserror::Error;

/// Top-level startup configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Deployment environment.
    #[serde(default)]
    pub environment: Environment,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Migration settings.
    #[serde(default)]
    pub migrations: MigrationsConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where migrations are read from and recorded.
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Directory holding the `.sql` artifacts and optional `manifest.toml`.
    #[serde(default = "default_migrations_dir")]
    pub directory: String,

    /// Name of the schema-version ledger table.
    #[serde(default = "default_ledger_table")]
    pub ledger_table: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "tessera_db=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_migrations_dir() -> String {
    "migrations".to_string()
}

fn default_ledger_table() -> String {
    tessera_db::migrations::DEFAULT_LEDGER_TABLE.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            directory: default_migrations_dir(),
            ledger_table: default_ledger_table(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults, then
/// applies environment overrides (see [`apply_overrides`]).
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

fn parsed<T: std::str::FromStr>(key: &str, raw: &str) -> Option<T> {
    let value = raw.trim().parse().ok();
    if value.is_none() {
        tracing::warn!(key, "ignoring unparseable environment override");
    }
    value
}

fn flag(raw: &str) -> bool {
    matches!(raw.trim(), "true" | "1")
}

/// Applies environment overrides looked up through `lookup`.
///
/// - `TESSERA_ENV` overrides `environment`
/// - `TESSERA_DB_ENGINE`, `TESSERA_DB_HOST`, `TESSERA_DB_PORT`,
///   `TESSERA_DB_USER`, `TESSERA_DB_PASSWORD`, `TESSERA_DB_NAME`,
///   `TESSERA_DB_SQLITE_PATH`, `TESSERA_DB_POOL_SIZE` override the matching
///   `database` keys
/// - `TESSERA_DB_ISOLATION_LEVEL` overrides `database.default_isolation`
/// - `TESSERA_DB_SKIP_VALIDATION` overrides `database.skip_validation`
///   (set to "true" to enable)
/// - `TESSERA_MIGRATIONS_DIR` overrides `migrations.directory`
/// - `TESSERA_LOG_LEVEL` overrides `logging.level`
/// - `TESSERA_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// Values that do not parse are ignored with a warning.
pub fn apply_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(env) = lookup("TESSERA_ENV") {
        if let Some(parsed) = parsed("TESSERA_ENV", &env) {
            config.environment = parsed;
        }
    }

    let db = &mut config.database;
    if let Some(engine) = lookup("TESSERA_DB_ENGINE") {
        if let Some(parsed) = parsed("TESSERA_DB_ENGINE", &engine) {
            db.engine = parsed;
        }
    }
    if let Some(host) = lookup("TESSERA_DB_HOST") {
        db.host = host;
    }
    if let Some(port) = lookup("TESSERA_DB_PORT") {
        if let Some(parsed) = parsed("TESSERA_DB_PORT", &port) {
            db.port = parsed;
        }
    }
    if let Some(user) = lookup("TESSERA_DB_USER") {
        db.user = user;
    }
    if let Some(password) = lookup("TESSERA_DB_PASSWORD") {
        db.password = password;
    }
    if let Some(name) = lookup("TESSERA_DB_NAME") {
        db.name = name;
    }
    if let Some(path) = lookup("TESSERA_DB_SQLITE_PATH") {
        db.sqlite_path = path;
    }
    if let Some(size) = lookup("TESSERA_DB_POOL_SIZE") {
        if let Some(parsed) = parsed("TESSERA_DB_POOL_SIZE", &size) {
            db.pool_size = parsed;
        }
    }
    if let Some(level) = lookup("TESSERA_DB_ISOLATION_LEVEL") {
        db.default_isolation = level;
    }
    if let Some(skip) = lookup("TESSERA_DB_SKIP_VALIDATION") {
        db.skip_validation = flag(&skip);
    }

    if let Some(dir) = lookup("TESSERA_MIGRATIONS_DIR") {
        config.migrations.directory = dir;
    }
    if let Some(level) = lookup("TESSERA_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("TESSERA_LOG_JSON") {
        config.logging.json = flag(&json);
    }
}
