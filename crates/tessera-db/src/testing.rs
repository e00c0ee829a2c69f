//! Scripted in-memory sessions for statement-sequence assertions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::driver::{Dialect, DriverError, Session};
use crate::error::ConnectionError;
use crate::pool::{Checkout, ConnectionPool, PoolState};
use crate::value::{Rows, Statement, Value};

#[derive(Default)]
struct Shared {
    statements: Mutex<Vec<String>>,
    failures: Mutex<Vec<Failure>>,
    checkouts: AtomicUsize,
    returned: AtomicUsize,
    poisoned: AtomicUsize,
}

struct Failure {
    needle: String,
    code: String,
    /// `None` fails forever.
    remaining: Option<usize>,
}

/// A pool whose sessions record every statement instead of running it.
#[derive(Clone, Default)]
pub(crate) struct FakePool {
    shared: Arc<Shared>,
}

impl FakePool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn pool(&self) -> ConnectionPool {
        ConnectionPool::from_checkout(Arc::new(self.clone()), Dialect::Postgres)
    }

    /// Makes every statement containing `needle` fail with `code`.
    pub(crate) fn fail_when(&self, needle: &str, code: &str) {
        self.push_failure(needle, code, None);
    }

    /// Like [`fail_when`](Self::fail_when), but only the first match fails.
    pub(crate) fn fail_once(&self, needle: &str, code: &str) {
        self.push_failure(needle, code, Some(1));
    }

    fn push_failure(&self, needle: &str, code: &str, remaining: Option<usize>) {
        self.shared.failures.lock().expect("failures lock").push(Failure {
            needle: needle.to_string(),
            code: code.to_string(),
            remaining,
        });
    }

    pub(crate) fn statements(&self) -> Vec<String> {
        self.shared.statements.lock().expect("statements lock").clone()
    }

    pub(crate) fn checkouts(&self) -> usize {
        self.shared.checkouts.load(Ordering::SeqCst)
    }

    pub(crate) fn returned(&self) -> usize {
        self.shared.returned.load(Ordering::SeqCst)
    }

    pub(crate) fn poisoned(&self) -> usize {
        self.shared.poisoned.load(Ordering::SeqCst)
    }
}

impl Checkout for FakePool {
    fn checkout(&self) -> Result<Box<dyn Session>, ConnectionError> {
        self.shared.checkouts.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            shared: Arc::clone(&self.shared),
        }))
    }

    fn state(&self) -> PoolState {
        PoolState {
            connections: 1,
            idle_connections: 1,
            max_size: 1,
        }
    }
}

struct FakeSession {
    shared: Arc<Shared>,
}

impl FakeSession {
    fn record(&self, text: &str) -> Result<(), DriverError> {
        self.shared
            .statements
            .lock()
            .expect("statements lock")
            .push(text.to_string());

        let mut failures = self.shared.failures.lock().expect("failures lock");
        let hit = failures
            .iter_mut()
            .find(|f| f.remaining != Some(0) && text.contains(f.needle.as_str()));
        match hit {
            Some(failure) => {
                if let Some(left) = failure.remaining.as_mut() {
                    *left -= 1;
                }
                Err(DriverError::new(
                    failure.code.clone(),
                    format!("scripted failure on {}", failure.needle),
                ))
            }
            None => Ok(()),
        }
    }
}

impl Session for FakeSession {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn run(&mut self, stmt: &Statement) -> Result<Rows, DriverError> {
        self.record(stmt.text())?;
        if stmt.text().starts_with("SELECT set_config") {
            let value = stmt.params().get(1).cloned().unwrap_or(Value::Null);
            return Ok(Rows::from_values(vec!["set_config".to_string()], vec![vec![value]]));
        }
        Ok(Rows::affected(0))
    }

    fn run_script(&mut self, sql: &str) -> Result<(), DriverError> {
        self.record(sql)
    }

    fn poison(&mut self) {
        self.shared.poisoned.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.shared.returned.fetch_add(1, Ordering::SeqCst);
    }
}
