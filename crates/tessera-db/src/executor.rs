//! Statement execution with timing and log-safe diagnostics.

use std::time::Instant;

use crate::driver::{Dialect, Session};
use crate::error::{DbError, QueryError};
use crate::pool::{ConnectionPool, PoolConnection};
use crate::sanitize;
use crate::value::{Rows, Statement};

/// Anything that can run statements.
///
/// A [`ConnectionPool`] leases a connection per call. A [`PoolConnection`]
/// or a [`Transaction`](crate::Transaction) reuses the connection it is
/// bound to, so every statement issued through it shares one session.
pub trait Executor {
    fn dialect(&self) -> Dialect;

    /// Runs one statement and returns its rows or affected count.
    fn query(&mut self, stmt: &Statement) -> Result<Rows, DbError>;

    /// Runs a multi-statement script without parameters.
    fn execute_script(&mut self, sql: &str) -> Result<(), DbError>;
}

pub(crate) fn run_logged(
    session: &mut dyn Session,
    lease: u64,
    stmt: &Statement,
) -> Result<Rows, QueryError> {
    let started = Instant::now();
    let result = session.run(stmt);
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let sql = sanitize::sanitize_sql(stmt.text());
    let params = sanitize::redact_params(stmt.text(), stmt.params());

    match result {
        Ok(rows) => {
            tracing::debug!(
                lease,
                sql = %sql,
                params = ?params,
                elapsed_ms,
                rows = rows.len(),
                rows_affected = rows.rows_affected(),
                "statement executed"
            );
            Ok(rows)
        }
        Err(err) => {
            let err = QueryError::from_driver(err, stmt.text());
            tracing::warn!(
                lease,
                sql = %sql,
                params = ?params,
                elapsed_ms,
                sql_state = %err.sql_state,
                error = %err.message,
                position = ?err.position,
                "statement failed"
            );
            Err(err)
        }
    }
}

pub(crate) fn run_script_logged(
    session: &mut dyn Session,
    lease: u64,
    sql: &str,
) -> Result<(), QueryError> {
    let started = Instant::now();
    let result = session.run_script(sql);
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let sanitized = sanitize::sanitize_sql(sql);

    match result {
        Ok(()) => {
            tracing::debug!(lease, sql = %sanitized, elapsed_ms, "script executed");
            Ok(())
        }
        Err(err) => {
            let err = QueryError::from_driver(err, sql);
            tracing::warn!(
                lease,
                elapsed_ms,
                sql_state = %err.sql_state,
                error = %err.message,
                position = ?err.position,
                "script failed"
            );
            Err(err)
        }
    }
}

impl Executor for PoolConnection {
    fn dialect(&self) -> Dialect {
        PoolConnection::dialect(self)
    }

    fn query(&mut self, stmt: &Statement) -> Result<Rows, DbError> {
        let lease = self.lease_id();
        Ok(run_logged(self.session_mut(), lease, stmt)?)
    }

    fn execute_script(&mut self, sql: &str) -> Result<(), DbError> {
        let lease = self.lease_id();
        Ok(run_script_logged(self.session_mut(), lease, sql)?)
    }
}

impl Executor for ConnectionPool {
    fn dialect(&self) -> Dialect {
        ConnectionPool::dialect(self)
    }

    fn query(&mut self, stmt: &Statement) -> Result<Rows, DbError> {
        let mut conn = self.acquire()?;
        let rows = conn.query(stmt);
        conn.release();
        rows
    }

    fn execute_script(&mut self, sql: &str) -> Result<(), DbError> {
        let mut conn = self.acquire()?;
        let result = conn.execute_script(sql);
        conn.release();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePool;

    #[test]
    fn pool_executor_leases_one_connection_per_statement() {
        let fake = FakePool::new();
        let mut pool = fake.pool();

        pool.query(&Statement::new("SELECT 1")).expect("first");
        pool.query(&Statement::new("SELECT 2")).expect("second");

        assert_eq!(fake.checkouts(), 2);
        assert_eq!(fake.returned(), 2);
        assert_eq!(fake.statements(), vec!["SELECT 1", "SELECT 2"]);
    }

    #[test]
    fn driver_failures_become_database_errors() {
        let fake = FakePool::new();
        fake.fail_when("SELEC", "42601");
        let mut pool = fake.pool();

        let err = pool
            .query(&Statement::new("SELEC 1"))
            .expect_err("statement should fail");

        assert_eq!(err.code(), crate::error::DATABASE_ERROR);
        assert_eq!(err.as_query().map(|q| q.sql_state.as_str()), Some("42601"));
        assert_eq!(fake.returned(), 1, "connection is released on failure");
    }

    #[test]
    fn bound_connection_reuses_one_session() {
        let fake = FakePool::new();
        let pool = fake.pool();
        let mut conn = pool.acquire().expect("lease");

        conn.query(&Statement::new("SELECT 1")).expect("first");
        conn.execute_script("SELECT 2; SELECT 3;").expect("script");
        conn.release();

        assert_eq!(fake.checkouts(), 1);
        assert_eq!(fake.statements(), vec!["SELECT 1", "SELECT 2; SELECT 3;"]);
    }
}
