//! Startup sequence: pool, connectivity probe, migrations, readiness.

use std::path::Path;

use tessera_db::{
    wait_for_database, CannedExecutor, ConnectionError, ConnectionPool, Dialect, Engine,
    MigrationError, MigrationReport, MigrationRunner, TransactionManager,
};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LoggingConfig};

/// Fatal startup failures. Any of these ends the process.
#[derive(Debug, Error)]
pub enum StartupError {
    /// The pool could not be built or the database never answered.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// A migration could not be discovered or applied.
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// `skip_validation` was requested in production.
    #[error("skip_validation is not allowed in production")]
    SkipValidationInProduction,
}

/// What startup produced.
#[derive(Debug)]
pub enum Started {
    /// The database is reachable and migrated. The transaction manager
    /// carries the configured default isolation level.
    Ready {
        transactions: TransactionManager,
        report: MigrationReport,
        probe_attempts: u32,
    },
    /// Validation was skipped; statements get canned results.
    Canned(CannedExecutor),
}

/// Initialises the global tracing subscriber from the logging config.
pub fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn dialect(engine: Engine) -> Dialect {
    match engine {
        Engine::Postgres => Dialect::Postgres,
        Engine::Sqlite => Dialect::Sqlite,
    }
}

/// Runs the startup sequence described by `config`.
///
/// # Errors
///
/// Returns `StartupError` if the pool cannot be built, the database stays
/// unreachable after every probe attempt, a migration fails, or validation
/// skipping is requested in production.
pub fn run(config: &Config) -> Result<Started, StartupError> {
    let db = &config.database;

    if db.skip_validation {
        let canned = CannedExecutor::new(config.environment, dialect(db.engine))
            .ok_or(StartupError::SkipValidationInProduction)?;
        tracing::warn!("skipping connectivity probe and migrations");
        return Ok(Started::Canned(canned));
    }

    let pool = ConnectionPool::from_config(db)?;
    let probe_attempts = wait_for_database(&pool, db.retry_policy())?;

    let report = MigrationRunner::new(pool.clone(), Path::new(&config.migrations.directory))
        .with_ledger_table(config.migrations.ledger_table.clone())
        .run()?;

    tracing::info!(
        environment = %config.environment,
        engine = pool.dialect().as_str(),
        applied = report.applied.len(),
        skipped = report.skipped.len(),
        "database ready"
    );

    let transactions = TransactionManager::new(pool, db.isolation());

    Ok(Started::Ready {
        transactions,
        report,
        probe_attempts,
    })
}
