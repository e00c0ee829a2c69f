//! Canned executor for running without a database.
//!
//! Returns one fixed row for every statement. It is a separate executor
//! that startup wires in place of the pool; the real executor never fakes
//! results, and this one cannot be built in production.

use crate::config::Environment;
use crate::driver::Dialect;
use crate::error::DbError;
use crate::executor::Executor;
use crate::sanitize;
use crate::value::{Rows, Statement, Value};

/// Column name of the canned row.
pub const CANNED_COLUMN: &str = "canned";

#[derive(Debug, Clone)]
pub struct CannedExecutor {
    dialect: Dialect,
}

impl CannedExecutor {
    /// Returns `None` in production.
    pub fn new(environment: Environment, dialect: Dialect) -> Option<Self> {
        if environment.is_production() {
            tracing::error!("canned executor refused in production");
            return None;
        }
        tracing::warn!(environment = %environment, "database validation skipped, serving canned results");
        Some(Self { dialect })
    }

    fn canned() -> Rows {
        Rows::from_values(vec![CANNED_COLUMN.to_string()], vec![vec![Value::Bool(true)]])
    }
}

impl Executor for CannedExecutor {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn query(&mut self, stmt: &Statement) -> Result<Rows, DbError> {
        tracing::debug!(sql = %sanitize::sanitize_sql(stmt.text()), "canned statement");
        Ok(Self::canned())
    }

    fn execute_script(&mut self, sql: &str) -> Result<(), DbError> {
        tracing::debug!(sql = %sanitize::sanitize_sql(sql), "canned script");
        Ok(())
    }
}
