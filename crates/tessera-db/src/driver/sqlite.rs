//! SQLite session driver.
//!
//! Used for local development and the test-suite. PostgreSQL's session
//! variable functions are emulated per connection so RLS views written
//! against `current_setting('app.current_user_id', true)` behave the same.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rusqlite::functions::FunctionFlags;
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{Connection, ToSql};

use super::{Dialect, DriverError, Session};
use crate::value::{Rows, Statement, Value};

struct Param<'a>(&'a Value);

impl ToSql for Param<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self.0 {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Value::Int(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Float(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Bytes(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

fn decode(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Bytes(bytes.to_vec()),
    }
}

fn char_position(sql: &str, byte_offset: usize) -> Option<u32> {
    let prefix = sql.get(..byte_offset)?;
    u32::try_from(prefix.chars().count() + 1).ok()
}

impl From<rusqlite::Error> for DriverError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, message) => DriverError::new(
                format!("{:?}", code.code),
                message.clone().unwrap_or_else(|| err.to_string()),
            ),
            rusqlite::Error::SqlInputError {
                error,
                msg,
                sql,
                offset,
            } => DriverError {
                position: usize::try_from(*offset)
                    .ok()
                    .and_then(|o| char_position(sql, o)),
                ..DriverError::new(format!("{:?}", error.code), msg.clone())
            },
            other => DriverError::new("SqliteError", other.to_string()),
        }
    }
}

impl Session for Connection {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn run(&mut self, stmt: &Statement) -> Result<Rows, DriverError> {
        let mut prepared = self.prepare(stmt.text())?;
        let params = rusqlite::params_from_iter(stmt.params().iter().map(Param));

        if prepared.column_count() == 0 {
            let affected = prepared.execute(params)?;
            return Ok(Rows::affected(affected as u64));
        }

        let columns: Vec<String> = prepared
            .column_names()
            .into_iter()
            .map(String::from)
            .collect();
        let width = columns.len();

        let mut rows = prepared.query(params)?;
        let mut values = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Vec::with_capacity(width);
            for idx in 0..width {
                record.push(decode(row.get_ref(idx)?));
            }
            values.push(record);
        }

        Ok(Rows::from_values(columns, values))
    }

    fn run_script(&mut self, sql: &str) -> Result<(), DriverError> {
        self.execute_batch(sql).map_err(|err| {
            // Batches prepare each statement from the remaining tail, so the
            // reported position is relative to that tail.
            let tail_start = match &err {
                rusqlite::Error::SqlInputError { sql: tail, .. } if sql.ends_with(tail.as_str()) => {
                    sql.len() - tail.len()
                }
                _ => 0,
            };
            let mut mapped = DriverError::from(err);
            if tail_start > 0 {
                let before = char_position(sql, tail_start).map_or(0, |p| p - 1);
                mapped.position = mapped.position.map(|p| p + before);
            }
            mapped
        })
    }
}

fn poisoned() -> rusqlite::Error {
    rusqlite::Error::UserFunctionError("session settings lock poisoned".into())
}

/// Installs `set_config(name, value, is_local)` and `current_setting(name)` /
/// `current_setting(name, missing_ok)` on one connection.
///
/// Settings live with the connection, like PostgreSQL session variables.
/// `is_local` is accepted for signature compatibility and ignored.
pub fn install_session_functions(conn: &Connection) -> rusqlite::Result<()> {
    let settings: Arc<Mutex<HashMap<String, String>>> = Arc::default();

    let store = Arc::clone(&settings);
    conn.create_scalar_function(
        "set_config",
        3,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DIRECTONLY,
        move |ctx| {
            let name: String = ctx.get(0)?;
            let value: String = ctx.get(1)?;
            store
                .lock()
                .map_err(|_| poisoned())?
                .insert(name, value.clone());
            Ok(value)
        },
    )?;

    let store = Arc::clone(&settings);
    conn.create_scalar_function(
        "current_setting",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_INNOCUOUS,
        move |ctx| {
            let name: String = ctx.get(0)?;
            let guard = store.lock().map_err(|_| poisoned())?;
            guard.get(&name).cloned().ok_or_else(|| {
                rusqlite::Error::UserFunctionError(
                    format!("unrecognized configuration parameter \"{name}\"").into(),
                )
            })
        },
    )?;

    let store = settings;
    conn.create_scalar_function(
        "current_setting",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_INNOCUOUS,
        move |ctx| {
            let name: String = ctx.get(0)?;
            let missing_ok: bool = ctx.get(1)?;
            let guard = store.lock().map_err(|_| poisoned())?;
            match guard.get(&name) {
                Some(value) => Ok(Some(value.clone())),
                None if missing_ok => Ok(None),
                None => Err(rusqlite::Error::UserFunctionError(
                    format!("unrecognized configuration parameter \"{name}\"").into(),
                )),
            }
        },
    )?;

    Ok(())
}
