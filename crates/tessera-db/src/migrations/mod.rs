//! Versioned migration engine.
//!
//! Migrations are `.sql` files read from a directory at startup. Each
//! version is applied at most once, tracked in the schema-version ledger.
//! Special artifacts run first, outside any transaction; every other
//! artifact runs in its own READ COMMITTED transaction together with its
//! ledger record, so a failing script leaves neither schema changes nor a
//! record behind. The first failure stops the run.

pub mod artifact;
pub mod diagnostics;
pub mod ledger;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub use artifact::{discover_artifacts, ArtifactKind, MigrationArtifact, MANIFEST_FILE};
pub use diagnostics::{locate, SourceLocation};
pub use ledger::DEFAULT_LEDGER_TABLE;

use crate::driver::is_valid_identifier;
use crate::error::DbError;
use crate::executor::Executor;
use crate::pool::ConnectionPool;
use crate::transaction::{IsolationLevel, TransactionManager};

/// Errors that can occur while discovering or applying migrations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The migrations directory or one of its files could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Discovery {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A `.sql` file has no leading numeric version.
    #[error("migration file '{0}' has no numeric version prefix")]
    InvalidFileName(String),

    /// Two files share one version.
    #[error("version {version} is used by both '{first}' and '{second}'")]
    DuplicateVersion {
        version: String,
        first: String,
        second: String,
    },

    /// `manifest.toml` could not be parsed.
    #[error("invalid migration manifest: {0}")]
    Manifest(#[from] toml::de::Error),

    /// `manifest.toml` names a file that is not in the directory.
    #[error("migration manifest names missing file '{0}'")]
    MissingManifestFile(String),

    /// The configured ledger table name is not a plain identifier.
    #[error("invalid ledger table name '{0}'")]
    InvalidLedgerTable(String),

    /// The ledger could not be created, read or written.
    #[error("schema version ledger failed: {0}")]
    Ledger(#[source] DbError),

    /// A migration script failed. Earlier artifacts stay applied.
    #[error("migration '{file}' (version {version}) failed: {source}{}", located(.location))]
    Apply {
        file: String,
        version: String,
        /// Line and column of the failure, when the engine reported one.
        location: Option<SourceLocation>,
        source: DbError,
    },
}

fn located(location: &Option<SourceLocation>) -> String {
    location
        .as_ref()
        .map(|l| format!(" (at {l})"))
        .unwrap_or_default()
}

/// What a migration run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Versions applied by this run, in order.
    pub applied: Vec<String>,
    /// Versions found already applied.
    pub skipped: Vec<String>,
    /// Bootstrap artifacts executed by this run.
    pub bootstrapped: Vec<String>,
}

/// Applies the migrations of one directory to one pool.
#[derive(Debug, Clone)]
pub struct MigrationRunner {
    manager: TransactionManager,
    directory: PathBuf,
    ledger_table: String,
}

impl MigrationRunner {
    pub fn new(pool: ConnectionPool, directory: impl Into<PathBuf>) -> Self {
        Self {
            manager: TransactionManager::new(pool, IsolationLevel::ReadCommitted),
            directory: directory.into(),
            ledger_table: DEFAULT_LEDGER_TABLE.to_string(),
        }
    }

    /// Uses `table` as the ledger instead of [`DEFAULT_LEDGER_TABLE`].
    pub fn with_ledger_table(mut self, table: impl Into<String>) -> Self {
        self.ledger_table = table.into();
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn ledger_table(&self) -> Result<&str, MigrationError> {
        if is_valid_identifier(&self.ledger_table) {
            Ok(&self.ledger_table)
        } else {
            Err(MigrationError::InvalidLedgerTable(self.ledger_table.clone()))
        }
    }

    fn pool(&self) -> ConnectionPool {
        self.manager.pool().clone()
    }

    /// Idempotently creates the ledger table.
    pub fn ensure_version_table(&self) -> Result<(), MigrationError> {
        let table = self.ledger_table()?;
        ledger::ensure_version_table(&mut self.pool(), table).map_err(MigrationError::Ledger)
    }

    /// Returns the recorded versions, or an empty set if there is no ledger.
    pub fn applied_versions(&self) -> Result<BTreeSet<String>, MigrationError> {
        let table = self.ledger_table()?;
        ledger::applied_versions(&mut self.pool(), table).map_err(MigrationError::Ledger)
    }

    pub fn discover_artifacts(&self) -> Result<Vec<MigrationArtifact>, MigrationError> {
        discover_artifacts(&self.directory)
    }

    /// Brings the schema up to date.
    ///
    /// # Errors
    ///
    /// Returns the first `MigrationError` encountered. Artifacts applied
    /// before it stay applied and recorded.
    pub fn run(&self) -> Result<MigrationReport, MigrationError> {
        let table = self.ledger_table()?;
        tracing::info!(
            directory = %self.directory.display(),
            ledger = table,
            "running migrations"
        );

        self.ensure_version_table()?;
        let applied = self.applied_versions()?;
        let artifacts = self.discover_artifacts()?;

        let mut report = MigrationReport::default();

        let (direct, transactional): (Vec<_>, Vec<_>) = artifacts
            .iter()
            .partition(|a| a.kind != ArtifactKind::Transactional);

        for artifact in direct {
            if artifact.kind == ArtifactKind::Special && applied.contains(&artifact.version) {
                tracing::info!(version = %artifact.version, file = %artifact.file_name, "already applied");
                report.skipped.push(artifact.version.clone());
                continue;
            }
            self.apply_direct(artifact, table)?;
            match artifact.kind {
                ArtifactKind::Bootstrap => report.bootstrapped.push(artifact.version.clone()),
                _ => report.applied.push(artifact.version.clone()),
            }
        }

        for artifact in transactional {
            if applied.contains(&artifact.version) {
                tracing::info!(version = %artifact.version, file = %artifact.file_name, "already applied");
                report.skipped.push(artifact.version.clone());
                continue;
            }
            self.apply_transactional(artifact, table)?;
            report.applied.push(artifact.version.clone());
        }

        tracing::info!(
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            bootstrapped = report.bootstrapped.len(),
            "migrations complete"
        );
        Ok(report)
    }

    fn apply_direct(&self, artifact: &MigrationArtifact, table: &str) -> Result<(), MigrationError> {
        tracing::info!(
            version = %artifact.version,
            file = %artifact.file_name,
            kind = ?artifact.kind,
            "applying migration outside a transaction"
        );

        let mut conn = self.pool().acquire().map_err(|e| apply_error(artifact, e.into()))?;
        conn.execute_script(&artifact.sql)
            .map_err(|e| apply_error(artifact, e))?;

        if artifact.kind == ArtifactKind::Special {
            ledger::record_version(&mut conn, table, &artifact.version, &artifact.description)
                .map_err(MigrationError::Ledger)?;
        }
        conn.release();
        Ok(())
    }

    fn apply_transactional(&self, artifact: &MigrationArtifact, table: &str) -> Result<(), MigrationError> {
        tracing::info!(version = %artifact.version, file = %artifact.file_name, "applying migration");

        self.manager
            .with_transaction(None, IsolationLevel::ReadCommitted, |tx| -> Result<(), DbError> {
                tx.execute_script(&artifact.sql)?;
                ledger::record_version(tx, table, &artifact.version, &artifact.description)
            })
            .map_err(|e| apply_error(artifact, e))?;

        tracing::info!(version = %artifact.version, file = %artifact.file_name, "migration applied");
        Ok(())
    }
}

fn apply_error(artifact: &MigrationArtifact, source: DbError) -> MigrationError {
    // Positions only mean something against the script itself, not the
    // ledger insert that follows it.
    let location = source
        .as_query()
        .filter(|q| q.statement == crate::sanitize::sanitize_sql(&artifact.sql))
        .and_then(|q| q.position)
        .and_then(|position| locate(&artifact.sql, position))
        .map(|mut location| {
            location.snippet = crate::sanitize::sanitize_sql(&location.snippet).into_owned();
            location
        });

    tracing::error!(
        version = %artifact.version,
        file = %artifact.file_name,
        line = location.as_ref().map(|l| l.line),
        column = location.as_ref().map(|l| l.column),
        snippet = location.as_ref().map(|l| l.snippet.as_str()),
        error = %source,
        "migration failed"
    );

    MigrationError::Apply {
        file: artifact.file_name.clone(),
        version: artifact.version.clone(),
        location,
        source,
    }
}

/// Runs the migrations in `directory` against `pool` with the default
/// ledger table.
///
/// # Errors
///
/// See [`MigrationRunner::run`].
pub fn run_migrations(pool: &ConnectionPool, directory: &Path) -> Result<MigrationReport, MigrationError> {
    MigrationRunner::new(pool.clone(), directory).run()
}
