//! The schema-version ledger: one row per applied migration version.

use std::collections::BTreeSet;

use crate::error::DbError;
use crate::executor::Executor;
use crate::value::Statement;

/// Default ledger table name.
pub const DEFAULT_LEDGER_TABLE: &str = "schema_versions";

/// Creates the ledger table if it does not exist yet.
pub fn ensure_version_table<X: Executor + ?Sized>(exec: &mut X, table: &str) -> Result<(), DbError> {
    let ddl = exec.dialect().ledger_ddl(table);
    exec.execute_script(&ddl)
}

/// Returns every recorded version. An absent ledger is an empty set.
pub fn applied_versions<X: Executor + ?Sized>(
    exec: &mut X,
    table: &str,
) -> Result<BTreeSet<String>, DbError> {
    let probe = exec.dialect().table_exists(table);
    let present = exec
        .query(&probe)?
        .first()
        .and_then(|row| row.get_index(0))
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    if !present {
        return Ok(BTreeSet::new());
    }

    let rows = exec.query(&Statement::new(format!("SELECT version FROM {table}")))?;
    Ok(rows
        .into_iter()
        .filter_map(|row| row.get_index(0).and_then(|v| v.as_str()).map(str::to_string))
        .collect())
}

/// Records `version`. Recording an already-present version is a no-op.
pub fn record_version<X: Executor + ?Sized>(
    exec: &mut X,
    table: &str,
    version: &str,
    description: &str,
) -> Result<(), DbError> {
    let dialect = exec.dialect();
    let stmt = Statement::new(format!(
        "INSERT INTO {table} (version, description) VALUES ({}, {}) ON CONFLICT (version) DO NOTHING",
        dialect.placeholder(1),
        dialect.placeholder(2)
    ))
    .bind(version)
    .bind(description);
    exec.query(&stmt)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{create_sqlite_pool, PoolSettings};

    #[test]
    fn absent_ledger_reads_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ledger.db");
        let mut pool = create_sqlite_pool(path.to_str().expect("utf-8 path"), PoolSettings::default())
            .expect("pool");

        let applied = applied_versions(&mut pool, DEFAULT_LEDGER_TABLE).expect("probe");
        assert!(applied.is_empty());
    }

    #[test]
    fn recording_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ledger.db");
        let mut pool = create_sqlite_pool(path.to_str().expect("utf-8 path"), PoolSettings::default())
            .expect("pool");

        ensure_version_table(&mut pool, DEFAULT_LEDGER_TABLE).expect("create");
        ensure_version_table(&mut pool, DEFAULT_LEDGER_TABLE).expect("create again");
        record_version(&mut pool, DEFAULT_LEDGER_TABLE, "001", "init").expect("record");
        record_version(&mut pool, DEFAULT_LEDGER_TABLE, "001", "init").expect("record again");

        let applied = applied_versions(&mut pool, DEFAULT_LEDGER_TABLE).expect("read");
        assert_eq!(applied.into_iter().collect::<Vec<_>>(), vec!["001".to_string()]);
    }
}
