//! Transaction manager.
//!
//! A unit of work runs on one leased connection between `BEGIN` and either
//! `COMMIT` or `ROLLBACK`. The outcome is decided once, and the connection
//! is released once, on every path including a panic inside the work.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::driver::Dialect;
use crate::error::{DbError, TransactionError};
use crate::executor::Executor;
use crate::pool::{ConnectionPool, PoolConnection};
use crate::rls::{self, Identity};
use crate::value::{Rows, Statement};

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// A textual isolation level was not one of the three supported levels.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown isolation level: {0}")]
pub struct UnknownIsolationLevel(pub String);

impl IsolationLevel {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }

    /// The PostgreSQL statement selecting this level inside an open
    /// transaction.
    pub fn set_statement(self) -> &'static str {
        match self {
            Self::ReadCommitted => "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
            Self::RepeatableRead => "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ",
            Self::Serializable => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
        }
    }

    /// Parses a level, falling back to READ COMMITTED with a warning.
    pub fn parse_lenient(raw: &str) -> Self {
        raw.parse().unwrap_or_else(|err: UnknownIsolationLevel| {
            tracing::warn!(error = %err, fallback = Self::ReadCommitted.as_sql(), "using default isolation level");
            Self::ReadCommitted
        })
    }
}

impl FromStr for IsolationLevel {
    type Err = UnknownIsolationLevel;

    /// Accepts `READ COMMITTED`, `read_committed`, `repeatable-read` and so on.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s
            .trim()
            .to_ascii_uppercase()
            .replace(['_', '-'], " ");
        match normalized.split_whitespace().collect::<Vec<_>>().join(" ").as_str() {
            "READ COMMITTED" => Ok(Self::ReadCommitted),
            "REPEATABLE READ" => Ok(Self::RepeatableRead),
            "SERIALIZABLE" => Ok(Self::Serializable),
            _ => Err(UnknownIsolationLevel(s.to_string())),
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

type CommitHook = Box<dyn FnOnce() + Send + 'static>;

/// Executor bound to one open transaction.
///
/// Every statement runs on the transaction's connection. A failing
/// statement dooms the transaction even if the work swallows the error.
pub struct Transaction<'c> {
    conn: &'c mut PoolConnection,
    isolation: IsolationLevel,
    failure: Option<DbError>,
    hooks: Vec<CommitHook>,
}

impl Transaction<'_> {
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.conn.identity()
    }

    pub fn lease_id(&self) -> u64 {
        self.conn.lease_id()
    }

    /// Registers `hook` to run after a successful commit. Hooks run in
    /// registration order and are dropped unrun on rollback.
    pub fn after_commit(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.hooks.push(Box::new(hook));
    }

    fn note(&mut self, err: &DbError) {
        if self.failure.is_none() {
            self.failure = Some(err.clone());
        }
    }
}

impl Executor for Transaction<'_> {
    fn dialect(&self) -> Dialect {
        self.conn.dialect()
    }

    fn query(&mut self, stmt: &Statement) -> Result<Rows, DbError> {
        self.conn.query(stmt).inspect_err(|err| self.note(err))
    }

    fn execute_script(&mut self, sql: &str) -> Result<(), DbError> {
        self.conn.execute_script(sql).inspect_err(|err| self.note(err))
    }
}

enum Outcome<T, E> {
    Committed(T),
    RolledBack(E),
}

/// Runs units of work inside transactions leased from one pool.
#[derive(Debug, Clone)]
pub struct TransactionManager {
    pool: ConnectionPool,
    default_isolation: IsolationLevel,
}

impl TransactionManager {
    pub fn new(pool: ConnectionPool, default_isolation: IsolationLevel) -> Self {
        Self {
            pool,
            default_isolation,
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn default_isolation(&self) -> IsolationLevel {
        self.default_isolation
    }

    /// [`with_transaction`](Self::with_transaction) at the default level.
    pub fn with_default<T, E, F>(&self, identity: Option<&str>, f: F) -> Result<T, E>
    where
        E: From<DbError> + fmt::Display,
        F: FnOnce(&mut Transaction<'_>) -> Result<T, E>,
    {
        self.with_transaction(identity, self.default_isolation, f)
    }

    /// Runs `f` inside one transaction.
    ///
    /// The optional `identity` is validated before a connection is leased
    /// and applied to the same connection after `BEGIN`. `f`'s result is
    /// committed when it is `Ok` and no statement failed; otherwise the
    /// transaction is rolled back and the original error returned.
    ///
    /// # Errors
    ///
    /// Returns `InvalidIdentity`, a connection error, a `BEGIN`/context/
    /// `COMMIT` failure, the first failed statement, or `f`'s own error.
    pub fn with_transaction<T, E, F>(
        &self,
        identity: Option<&str>,
        isolation: IsolationLevel,
        f: F,
    ) -> Result<T, E>
    where
        E: From<DbError> + fmt::Display,
        F: FnOnce(&mut Transaction<'_>) -> Result<T, E>,
    {
        let identity = identity.map(Identity::parse).transpose()?;
        let mut conn = self.pool.acquire().map_err(DbError::from)?;

        if let Err(err) = begin(&mut conn, isolation) {
            rollback_if_open(&mut conn, &err);
            conn.release();
            return Err(err.into());
        }

        if let Some(identity) = &identity {
            if let Err(err) = rls::set_context(&mut conn, identity) {
                rollback_if_open(&mut conn, &err);
                conn.release();
                return Err(err.into());
            }
        }

        let (outcome, hooks) = {
            let mut tx = Transaction {
                conn: &mut conn,
                isolation,
                failure: None,
                hooks: Vec::new(),
            };
            let outcome = match (f(&mut tx), tx.failure.take()) {
                (Ok(value), None) => Outcome::Committed(value),
                (Ok(_), Some(failure)) => {
                    tracing::warn!(
                        lease = tx.lease_id(),
                        error = %failure,
                        "statement failed inside transaction, rolling back"
                    );
                    Outcome::RolledBack(E::from(failure))
                }
                (Err(err), _) => Outcome::RolledBack(err),
            };
            (outcome, tx.hooks)
        };

        let lease = conn.lease_id();
        match outcome {
            Outcome::Committed(value) => {
                let commit = Statement::new(conn.dialect().commit());
                if let Err(err) = conn.query(&commit) {
                    rollback_if_open(&mut conn, &err);
                    conn.release();
                    return Err(err.into());
                }
                conn.set_in_transaction(false);
                conn.release();

                tracing::debug!(lease, isolation = %isolation, hooks = hooks.len(), "transaction committed");
                for hook in hooks {
                    hook();
                }
                Ok(value)
            }
            Outcome::RolledBack(err) => {
                rollback_if_open(&mut conn, &err);
                conn.release();
                tracing::debug!(lease, isolation = %isolation, error = %err, "transaction rolled back");
                Err(err)
            }
        }
    }
}

fn begin(conn: &mut PoolConnection, isolation: IsolationLevel) -> Result<(), DbError> {
    for text in conn.dialect().begin(isolation) {
        conn.query(&Statement::new(text))?;
        conn.set_in_transaction(true);
    }
    Ok(())
}

/// Rolls back an open transaction. A rollback failure is logged and never
/// replaces `original`.
fn rollback_if_open(conn: &mut PoolConnection, original: &dyn fmt::Display) {
    if !conn.in_transaction() {
        return;
    }
    let rollback = Statement::new(conn.dialect().rollback());
    let result = conn.query(&rollback);
    conn.set_in_transaction(false);

    if let Err(err) = result {
        let failure = TransactionError {
            original: original.to_string(),
            rollback: err,
        };
        tracing::error!(lease = conn.lease_id(), error = %failure, "transaction rollback failed");
        // The session state is unknown; the pool must not lease it again.
        conn.session_mut().poison();
    }
}
