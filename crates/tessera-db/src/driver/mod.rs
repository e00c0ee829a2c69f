//! Engine drivers.
//!
//! A [`Session`] is one physical database connection. Everything above this
//! module talks to sessions through driver-neutral [`Statement`]s and
//! [`Rows`]; engine-specific SQL lives in [`Dialect`].

pub mod pg;
pub mod sqlite;

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::transaction::IsolationLevel;
use crate::value::{Rows, Statement};

static IDENTIFIER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("valid identifier pattern")
});

/// Returns `true` if `name` is a plain, unquoted SQL identifier that is safe
/// to interpolate into DDL.
pub fn is_valid_identifier(name: &str) -> bool {
    IDENTIFIER_RE.is_match(name)
}

/// A failure reported by the engine, in its own terms.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code}: {message}")]
pub struct DriverError {
    /// SQLSTATE for PostgreSQL, result code name for SQLite.
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    /// 1-based character offset of the failure in the submitted text.
    pub position: Option<u32>,
}

impl DriverError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            detail: None,
            hint: None,
            position: None,
        }
    }
}

/// One physical connection to the engine.
pub trait Session: Send {
    fn dialect(&self) -> Dialect;

    /// Executes one statement with positional parameters.
    fn run(&mut self, stmt: &Statement) -> Result<Rows, DriverError>;

    /// Executes a multi-statement script without parameters.
    fn run_script(&mut self, sql: &str) -> Result<(), DriverError>;

    /// Returns `true` once the underlying connection is unusable.
    fn is_closed(&self) -> bool {
        false
    }

    /// Marks the connection unusable so the pool closes it instead of
    /// leasing it again.
    fn poison(&mut self) {}
}

impl<M> Session for r2d2::PooledConnection<M>
where
    M: r2d2::ManageConnection,
    M::Connection: Session,
{
    fn dialect(&self) -> Dialect {
        (**self).dialect()
    }

    fn run(&mut self, stmt: &Statement) -> Result<Rows, DriverError> {
        (**self).run(stmt)
    }

    fn run_script(&mut self, sql: &str) -> Result<(), DriverError> {
        (**self).run_script(sql)
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }

    fn poison(&mut self) {
        (**self).poison()
    }
}

/// Engine-specific SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
        }
    }

    /// Positional placeholder for the `n`th (1-based) parameter.
    pub fn placeholder(self, n: usize) -> String {
        match self {
            Self::Postgres => format!("${n}"),
            Self::Sqlite => format!("?{n}"),
        }
    }

    /// Statements that open a transaction at the given isolation level.
    ///
    /// PostgreSQL gets `BEGIN` followed by `SET TRANSACTION`. SQLite has no
    /// isolation levels; its snapshot reads already satisfy READ COMMITTED
    /// and REPEATABLE READ, and SERIALIZABLE takes the write lock up front.
    pub fn begin(self, isolation: IsolationLevel) -> Vec<&'static str> {
        match self {
            Self::Postgres => vec!["BEGIN", isolation.set_statement()],
            Self::Sqlite => match isolation {
                IsolationLevel::Serializable => vec!["BEGIN IMMEDIATE"],
                IsolationLevel::ReadCommitted | IsolationLevel::RepeatableRead => {
                    vec!["BEGIN DEFERRED"]
                }
            },
        }
    }

    pub fn commit(self) -> &'static str {
        "COMMIT"
    }

    pub fn rollback(self) -> &'static str {
        "ROLLBACK"
    }

    /// DDL for the schema-version ledger. `table` must already be validated
    /// with [`is_valid_identifier`].
    pub fn ledger_ddl(self, table: &str) -> String {
        match self {
            Self::Postgres => format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    version TEXT PRIMARY KEY,
                    applied_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    description TEXT NOT NULL DEFAULT ''
                )"
            ),
            Self::Sqlite => format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    version TEXT PRIMARY KEY,
                    applied_at TEXT NOT NULL DEFAULT (datetime('now')),
                    description TEXT NOT NULL DEFAULT ''
                );"
            ),
        }
    }

    /// Query returning a single boolean-ish column: does `table` exist?
    pub fn table_exists(self, table: &str) -> Statement {
        match self {
            Self::Postgres => {
                Statement::new("SELECT to_regclass($1) IS NOT NULL AS present").bind(table)
            }
            Self::Sqlite => Statement::new(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1) AS present",
            )
            .bind(table),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_begin_sets_isolation_explicitly() {
        assert_eq!(
            Dialect::Postgres.begin(IsolationLevel::RepeatableRead),
            vec!["BEGIN", "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ"]
        );
    }

    #[test]
    fn sqlite_serializable_takes_write_lock() {
        assert_eq!(
            Dialect::Sqlite.begin(IsolationLevel::Serializable),
            vec!["BEGIN IMMEDIATE"]
        );
        assert_eq!(
            Dialect::Sqlite.begin(IsolationLevel::ReadCommitted),
            vec!["BEGIN DEFERRED"]
        );
    }

    #[test]
    fn placeholders_follow_engine_syntax() {
        assert_eq!(Dialect::Postgres.placeholder(2), "$2");
        assert_eq!(Dialect::Sqlite.placeholder(2), "?2");
    }

    #[test]
    fn identifiers_reject_injection() {
        assert!(is_valid_identifier("schema_versions"));
        assert!(!is_valid_identifier("versions; DROP TABLE users"));
        assert!(!is_valid_identifier("1versions"));
        assert!(!is_valid_identifier(""));
    }
}
