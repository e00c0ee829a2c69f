#![allow(dead_code)]

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tessera_db::{create_sqlite_pool, ConnectionPool, Executor, PoolSettings, Statement, Value};

/// A SQLite database and a migrations directory inside one temp dir.
pub struct TestDb {
    pub dir: TempDir,
    pub pool: ConnectionPool,
}

impl TestDb {
    pub fn new(max_size: u32) -> Self {
        let dir = tempfile::tempdir().expect("should create tempdir");
        std::fs::create_dir(dir.path().join("migrations")).expect("should create migrations dir");
        let path = dir.path().join("test.db");
        let settings = PoolSettings {
            max_size,
            ..PoolSettings::default()
        };
        let pool = create_sqlite_pool(path.to_str().expect("utf-8 path"), settings)
            .expect("should create pool");
        Self { dir, pool }
    }

    pub fn migrations(&self) -> PathBuf {
        self.dir.path().join("migrations")
    }

    pub fn write_migration(&self, name: &str, sql: &str) {
        write(&self.migrations(), name, sql);
    }

    pub fn count(&self, sql: &str) -> i64 {
        scalar(&self.pool, sql)
            .as_i64()
            .expect("count should be an integer")
    }

    pub fn table_exists(&self, table: &str) -> bool {
        let mut pool = self.pool.clone();
        let rows = pool
            .query(&Statement::new(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            ).bind(table))
            .expect("should query sqlite_master");
        rows.first().and_then(|r| r.get_index(0)).and_then(Value::as_i64) == Some(1)
    }

    pub fn columns(&self, table: &str) -> Vec<String> {
        let mut pool = self.pool.clone();
        let rows = pool
            .query(&Statement::new(format!("PRAGMA table_info({table})")))
            .expect("should read table info");
        rows.into_iter()
            .filter_map(|r| r.get("name").and_then(Value::as_str).map(str::to_string))
            .collect()
    }
}

pub fn write(dir: &Path, name: &str, body: &str) {
    std::fs::write(dir.join(name), body).expect("should write fixture");
}

pub fn scalar(pool: &ConnectionPool, sql: &str) -> Value {
    let mut pool = pool.clone();
    let rows = pool.query(&Statement::new(sql)).expect("should run scalar query");
    rows.first()
        .and_then(|r| r.get_index(0))
        .cloned()
        .expect("scalar query should return a value")
}
