//! Row-level-security context propagation.
//!
//! The acting user is carried in the session variable
//! [`IDENTITY_SETTING`]. Tenant-filtering policies and views read it with
//! `current_setting('app.current_user_id', true)`. The variable belongs to
//! the leased connection; it is cleared before the connection goes back to
//! the pool.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::driver::{DriverError, Session};
use crate::error::DbError;
use crate::executor::Executor;
use crate::pool::{ConnectionPool, PoolConnection};
use crate::value::Statement;

/// Session variable holding the acting user's id.
pub const IDENTITY_SETTING: &str = "app.current_user_id";

/// A validated RLS identity: a UUID in canonical hyphenated form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identity(Uuid);

impl Identity {
    /// Validates `raw` as a canonical hyphenated UUID.
    ///
    /// Braced, URN and unhyphenated spellings are rejected as well as
    /// anything that is not a UUID at all.
    ///
    /// # Errors
    ///
    /// Returns `DbError::InvalidIdentity` for any other input.
    pub fn parse(raw: &str) -> Result<Self, DbError> {
        if raw.len() != 36 {
            return Err(DbError::InvalidIdentity(
                "expected a hyphenated UUID".to_string(),
            ));
        }
        Uuid::try_parse(raw)
            .map(Self)
            .map_err(|e| DbError::InvalidIdentity(format!("expected a hyphenated UUID: {e}")))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl FromStr for Identity {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<Uuid> for Identity {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

fn assignment(conn: &PoolConnection, value: &str) -> Statement {
    let dialect = conn.dialect();
    Statement::new(format!(
        "SELECT set_config({}, {}, false)",
        dialect.placeholder(1),
        dialect.placeholder(2)
    ))
    .bind(IDENTITY_SETTING)
    .bind(value)
}

/// Assigns `identity` to the session variable on this connection only.
///
/// # Errors
///
/// Returns the statement's `DbError` if the assignment fails. Callers must
/// not run tenant-scoped statements on the connection afterwards.
pub fn set_context(conn: &mut PoolConnection, identity: &Identity) -> Result<(), DbError> {
    let stmt = assignment(conn, &identity.to_string());
    conn.mark_context_dirty();
    conn.query(&stmt)?;
    conn.set_identity(*identity);

    tracing::debug!(lease = conn.lease_id(), identity = %identity, "rls context set");
    Ok(())
}

/// Runs `f` on a dedicated connection scoped to `identity`.
///
/// The identity is validated before anything is leased. If the context
/// cannot be set, `f` is never called. The connection is released whatever
/// `f` returns.
///
/// # Errors
///
/// Returns `InvalidIdentity`, a connection or context failure, or whatever
/// `f` returns.
pub fn with_context<T, E, F>(pool: &ConnectionPool, identity: &str, f: F) -> Result<T, E>
where
    E: From<DbError>,
    F: FnOnce(&mut PoolConnection) -> Result<T, E>,
{
    let identity = Identity::parse(identity)?;
    let mut conn = pool.acquire().map_err(DbError::from)?;

    if let Err(err) = set_context(&mut conn, &identity) {
        tracing::warn!(lease = conn.lease_id(), error = %err, "failed to set rls context");
        conn.release();
        return Err(err.into());
    }

    let result = f(&mut conn);
    conn.release();
    result
}

/// Resets the session variable directly on a session. Used on release.
pub(crate) fn clear_session(session: &mut dyn Session) -> Result<(), DriverError> {
    let dialect = session.dialect();
    let stmt = Statement::new(format!(
        "SELECT set_config({}, '', false)",
        dialect.placeholder(1)
    ))
    .bind(IDENTITY_SETTING);
    session.run(&stmt).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePool;

    const USER: &str = "6f1c8f2e-3b7a-4c55-9d2e-0a1b2c3d4e5f";

    #[test]
    fn identity_requires_hyphenated_uuid() {
        assert!(Identity::parse(USER).is_ok());
        assert!(Identity::parse("6f1c8f2e3b7a4c559d2e0a1b2c3d4e5f").is_err());
        assert!(Identity::parse("{6f1c8f2e-3b7a-4c55-9d2e-0a1b2c3d4e5f}").is_err());
        assert!(Identity::parse("1'; DROP TABLE notes; --").is_err());
        assert!(Identity::parse("").is_err());
    }

    #[test]
    fn malformed_identity_sends_nothing() {
        let fake = FakePool::new();
        let pool = fake.pool();
        let mut called = false;

        let err = with_context(&pool, "not-a-uuid", |_conn| -> Result<(), DbError> {
            called = true;
            Ok(())
        })
        .expect_err("malformed identity should be rejected");

        assert_eq!(err.code(), crate::error::INVALID_IDENTITY);
        assert!(!called);
        assert_eq!(fake.checkouts(), 0);
        assert!(fake.statements().is_empty());
    }

    #[test]
    fn context_is_bound_then_cleared_on_release() {
        let fake = FakePool::new();
        let pool = fake.pool();

        with_context(&pool, USER, |conn| -> Result<(), DbError> {
            assert_eq!(conn.identity().map(ToString::to_string).as_deref(), Some(USER));
            conn.query(&Statement::new("SELECT * FROM my_notes"))?;
            Ok(())
        })
        .expect("scoped work should succeed");

        assert_eq!(
            fake.statements(),
            vec![
                "SELECT set_config($1, $2, false)",
                "SELECT * FROM my_notes",
                "SELECT set_config($1, '', false)",
            ]
        );
        assert_eq!(fake.returned(), 1);
    }

    #[test]
    fn failed_assignment_fails_closed() {
        let fake = FakePool::new();
        fake.fail_when("set_config($1, $2", "42501");
        let pool = fake.pool();
        let mut called = false;

        let err = with_context(&pool, USER, |_conn| -> Result<(), DbError> {
            called = true;
            Ok(())
        })
        .expect_err("context failure should propagate");

        assert!(err.as_query().is_some());
        assert!(!called, "work must not run without a context");
        assert_eq!(fake.returned(), 1);
    }
}
