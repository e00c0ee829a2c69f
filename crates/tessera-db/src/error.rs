//! Error taxonomy for the data-access layer and the payload shape handed to
//! callers above it.

use serde::Serialize;
use thiserror::Error;

use crate::driver::DriverError;
use crate::sanitize;

/// Stable classification for every failed statement.
pub const DATABASE_ERROR: &str = "DATABASE_ERROR";
/// Classification for pool and connectivity failures.
pub const CONNECTION_ERROR: &str = "CONNECTION_ERROR";
/// Classification for a rejected RLS identity.
pub const INVALID_IDENTITY: &str = "INVALID_IDENTITY";

/// A connection could not be established or leased.
#[derive(Debug, Clone, Error)]
#[error("database connection unavailable: {message}")]
pub struct ConnectionError {
    message: String,
}

impl ConnectionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<r2d2::Error> for ConnectionError {
    fn from(err: r2d2::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// A statement failed inside the engine.
///
/// The native SQLSTATE (or SQLite result code) and the engine's character
/// position are kept verbatim; the message, detail and statement text are
/// stored sanitised so the error can be logged or returned as-is.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("query failed [{sql_state}]: {message}")]
pub struct QueryError {
    /// Native engine code, e.g. `42601` or `SQLITE_CONSTRAINT_UNIQUE`.
    pub sql_state: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    /// 1-based character offset into the submitted text, when reported.
    pub position: Option<u32>,
    /// Sanitised statement text.
    pub statement: String,
}

impl QueryError {
    pub(crate) fn from_driver(err: DriverError, statement: &str) -> Self {
        Self {
            sql_state: err.code,
            message: sanitize::sanitize_sql(&err.message).into_owned(),
            detail: err.detail.map(|d| sanitize::sanitize_sql(&d).into_owned()),
            hint: err.hint,
            position: err.position,
            statement: sanitize::sanitize_sql(statement).into_owned(),
        }
    }

    /// Always [`DATABASE_ERROR`], whatever the driver's native error shape.
    pub fn code(&self) -> &'static str {
        DATABASE_ERROR
    }
}

/// Rolling back a failed transaction failed as well.
///
/// Only ever logged: the error that triggered the rollback is the one
/// returned to the caller.
#[derive(Debug, Error)]
#[error("rollback failed after `{original}`: {rollback}")]
pub struct TransactionError {
    pub original: String,
    pub rollback: DbError,
}

/// Errors surfaced by the pool, executor, RLS and transaction layers.
#[derive(Debug, Clone, Error)]
pub enum DbError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Query(#[from] QueryError),

    /// The RLS identity is not a canonical hyphenated UUID.
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
}

impl DbError {
    /// Stable classification string for API consumers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection(_) => CONNECTION_ERROR,
            Self::Query(e) => e.code(),
            Self::InvalidIdentity(_) => INVALID_IDENTITY,
        }
    }

    /// Suggested HTTP status for the API layer.
    pub fn status(&self) -> u16 {
        match self {
            Self::Connection(_) => 503,
            Self::Query(_) => 500,
            Self::InvalidIdentity(_) => 400,
        }
    }

    /// Returns the underlying query error, if any.
    pub fn as_query(&self) -> Option<&QueryError> {
        match self {
            Self::Query(e) => Some(e),
            _ => None,
        }
    }

    /// Builds the serialisable payload handed to callers above this layer.
    pub fn to_payload(&self) -> ErrorPayload {
        let details = match self {
            Self::Query(e) => ErrorDetails {
                original_error: e.message.clone(),
                code: Some(e.sql_state.clone()),
                detail: e.detail.clone(),
                position: e.position,
            },
            Self::Connection(e) => ErrorDetails {
                original_error: e.message().to_string(),
                code: None,
                detail: None,
                position: None,
            },
            Self::InvalidIdentity(reason) => ErrorDetails {
                original_error: reason.clone(),
                code: None,
                detail: None,
                position: None,
            },
        };

        let message = match self {
            Self::Query(_) => "database query failed".to_string(),
            other => other.to_string(),
        };

        ErrorPayload {
            code: self.code().to_string(),
            message,
            status: self.status(),
            details,
        }
    }
}

/// Error shape returned to the API layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub status: u16,
    pub details: ErrorDetails,
}

/// Native error information nested in [`ErrorPayload`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    pub original_error: String,
    pub code: Option<String>,
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn syntax_error() -> DbError {
        DbError::Query(QueryError::from_driver(
            DriverError {
                code: "42601".to_string(),
                message: "syntax error at or near \"SELEC\"".to_string(),
                detail: None,
                hint: Some("check the statement".to_string()),
                position: Some(1),
            },
            "SELEC 1",
        ))
    }

    #[test]
    fn query_errors_classify_as_database_error() {
        let err = syntax_error();
        assert_eq!(err.code(), DATABASE_ERROR);
        assert_eq!(err.status(), 500);
        assert_eq!(err.as_query().and_then(|q| q.position), Some(1));
    }

    #[test]
    fn payload_serialises_with_camel_case_details() {
        let json = serde_json::to_value(syntax_error().to_payload()).expect("serialise");

        assert_eq!(json["code"], "DATABASE_ERROR");
        assert_eq!(json["status"], 500);
        assert_eq!(json["details"]["originalError"], "syntax error at or near \"SELEC\"");
        assert_eq!(json["details"]["code"], "42601");
        assert_eq!(json["details"]["position"], 1);
    }

    #[test]
    fn payload_omits_missing_position() {
        let err = DbError::InvalidIdentity("expected a hyphenated UUID".to_string());
        let json = serde_json::to_value(err.to_payload()).expect("serialise");

        assert_eq!(json["code"], "INVALID_IDENTITY");
        assert_eq!(json["status"], 400);
        assert!(json["details"].get("position").is_none());
    }

    #[test]
    fn query_error_detail_is_sanitised() {
        let err = QueryError::from_driver(
            DriverError {
                code: "23505".to_string(),
                message: "duplicate key".to_string(),
                detail: Some("Key (password)=('hunter2') already exists.".to_string()),
                hint: None,
                position: None,
            },
            "INSERT INTO accounts (password) VALUES ('hunter2')",
        );

        assert!(!err.statement.contains("hunter2"));
        assert!(!err.detail.unwrap_or_default().contains("hunter2"));
    }

    #[test]
    fn query_error_message_is_sanitised() {
        let err = DbError::Query(QueryError::from_driver(
            DriverError {
                code: "22P02".to_string(),
                message: "invalid input value for api_key: 'k-live-123'".to_string(),
                detail: None,
                hint: None,
                position: None,
            },
            "UPDATE accounts SET api_key = $1",
        ));

        let payload = err.to_payload();
        assert!(!payload.details.original_error.contains("k-live-123"));
        assert!(payload.details.original_error.starts_with("invalid input value for api_key"));
        assert!(!err.to_string().contains("k-live-123"));
    }
}
