//! Startup connectivity probe.

use std::time::Duration;

use crate::error::{ConnectionError, DbError};
use crate::executor::Executor;
use crate::pool::ConnectionPool;
use crate::value::Statement;

/// Fixed-delay retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_secs(2),
        }
    }
}

fn probe_once(pool: &ConnectionPool) -> Result<(), DbError> {
    let mut conn = pool.acquire()?;
    conn.query(&Statement::new("SELECT 1"))?;
    conn.release();
    Ok(())
}

/// Blocks until the database answers `SELECT 1`.
///
/// Returns the number of attempts used. Only startup should call this;
/// ordinary calls never retry.
///
/// # Errors
///
/// Returns `ConnectionError` once every attempt has failed.
pub fn wait_for_database(pool: &ConnectionPool, policy: RetryPolicy) -> Result<u32, ConnectionError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match probe_once(pool) {
            Ok(()) => {
                tracing::info!(attempt, "database reachable");
                return Ok(attempt);
            }
            Err(err) if attempt >= max_attempts => {
                tracing::error!(attempt, error = %err, "database unreachable, giving up");
                return Err(ConnectionError::new(format!(
                    "database unreachable after {attempt} attempts: {err}"
                )));
            }
            Err(err) => {
                tracing::warn!(
                    attempt,
                    max_attempts,
                    retry_in_ms = policy.delay.as_millis() as u64,
                    error = %err,
                    "database not reachable yet"
                );
                std::thread::sleep(policy.delay);
            }
        }
    }
}
