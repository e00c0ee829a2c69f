//! Database and environment configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::probe::RetryPolicy;
use crate::transaction::IsolationLevel;

/// Deployment environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Test,
    Production,
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Test => "test",
            Self::Production => "production",
        }
    }

    pub fn is_production(self) -> bool {
        self == Self::Production
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A textual enum value was not recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl FromStr for Environment {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "test" => Ok(Self::Test),
            "production" | "prod" => Ok(Self::Production),
            _ => Err(UnknownVariant {
                kind: "environment",
                value: s.to_string(),
            }),
        }
    }
}

/// Database engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    #[default]
    Postgres,
    Sqlite,
}

impl FromStr for Engine {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "sqlite" => Ok(Self::Sqlite),
            _ => Err(UnknownVariant {
                kind: "database engine",
                value: s.to_string(),
            }),
        }
    }
}

/// Database configuration.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Which engine to connect to.
    pub engine: Engine,

    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,

    /// Database name.
    pub name: String,

    /// Path to the SQLite database file, used when `engine = "sqlite"`.
    pub sqlite_path: String,

    /// Maximum number of pooled connections.
    pub pool_size: u32,

    /// How long to wait for a free pooled connection.
    pub acquire_timeout_ms: u64,

    /// SQLite busy timeout.
    pub busy_timeout_ms: u64,

    /// Isolation level for transactions that do not ask for one. Unknown
    /// values fall back to READ COMMITTED.
    pub default_isolation: String,

    /// Serve canned results instead of touching the database. Refused in
    /// production.
    pub skip_validation: bool,

    /// Startup connectivity probe attempts.
    pub connect_retry_attempts: u32,

    /// Delay between startup connectivity probe attempts.
    pub connect_retry_delay_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            engine: Engine::default(),
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            name: "tessera".to_string(),
            sqlite_path: "tessera.db".to_string(),
            pool_size: 10,
            acquire_timeout_ms: 30_000,
            busy_timeout_ms: 5_000,
            default_isolation: IsolationLevel::ReadCommitted.as_sql().to_string(),
            skip_validation: false,
            connect_retry_attempts: 10,
            connect_retry_delay_ms: 2_000,
        }
    }
}

impl DatabaseConfig {
    /// The configured default isolation level, parsed leniently.
    pub fn isolation(&self) -> IsolationLevel {
        IsolationLevel::parse_lenient(&self.default_isolation)
    }

    /// Retry policy for the startup connectivity probe.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.connect_retry_attempts.max(1),
            delay: Duration::from_millis(self.connect_retry_delay_ms),
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let password = if self.password.is_empty() { "" } else { "[REDACTED]" };
        f.debug_struct("DatabaseConfig")
            .field("engine", &self.engine)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &password)
            .field("name", &self.name)
            .field("sqlite_path", &self.sqlite_path)
            .field("pool_size", &self.pool_size)
            .field("acquire_timeout_ms", &self.acquire_timeout_ms)
            .field("busy_timeout_ms", &self.busy_timeout_ms)
            .field("default_isolation", &self.default_isolation)
            .field("skip_validation", &self.skip_validation)
            .field("connect_retry_attempts", &self.connect_retry_attempts)
            .field("connect_retry_delay_ms", &self.connect_retry_delay_ms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_redacts_password() {
        let config = DatabaseConfig {
            password: "s3cret-pw".to_string(),
            ..DatabaseConfig::default()
        };
        let rendered = format!("{config:?}");

        assert!(!rendered.contains("s3cret-pw"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: DatabaseConfig =
            toml::from_str("engine = \"sqlite\"\nsqlite_path = \"/tmp/t.db\"").expect("parse");

        assert_eq!(config.engine, Engine::Sqlite);
        assert_eq!(config.sqlite_path, "/tmp/t.db");
        assert_eq!(config.pool_size, 10);
        assert_eq!(config.isolation(), IsolationLevel::ReadCommitted);
    }

    #[test]
    fn unknown_isolation_falls_back() {
        let config = DatabaseConfig {
            default_isolation: "chaos".to_string(),
            ..DatabaseConfig::default()
        };
        assert_eq!(config.isolation(), IsolationLevel::ReadCommitted);
    }

    #[test]
    fn environments_parse_case_insensitively() {
        assert_eq!("PRODUCTION".parse::<Environment>(), Ok(Environment::Production));
        assert_eq!("dev".parse::<Environment>(), Ok(Environment::Development));
        assert!("staging".parse::<Environment>().is_err());
    }
}
