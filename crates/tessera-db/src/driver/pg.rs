//! PostgreSQL session driver.

use std::error::Error as StdError;

use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use postgres::error::ErrorPosition;
use postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use postgres::{Client, Row};

use super::{Dialect, DriverError, Session};
use crate::value::{Rows, Statement, Value};

/// SQLSTATE reported for client-side failures that never reached the server.
const CONNECTION_FAILURE: &str = "08006";
const INTERNAL_ERROR: &str = "XX000";

impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => b.to_sql(ty, out),
            Value::Int(i) => {
                if *ty == Type::INT2 {
                    i16::try_from(*i)?.to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    i32::try_from(*i)?.to_sql(ty, out)
                } else if *ty == Type::FLOAT8 {
                    (*i as f64).to_sql(ty, out)
                } else {
                    i.to_sql(ty, out)
                }
            }
            Value::Float(f) => {
                if *ty == Type::FLOAT4 {
                    (*f as f32).to_sql(ty, out)
                } else {
                    f.to_sql(ty, out)
                }
            }
            Value::Text(s) => {
                if *ty == Type::UUID {
                    uuid::Uuid::parse_str(s)?.to_sql(ty, out)
                } else if *ty == Type::JSON || *ty == Type::JSONB {
                    serde_json::from_str::<serde_json::Value>(s)?.to_sql(ty, out)
                } else if *ty == Type::TIMESTAMPTZ {
                    s.parse::<DateTime<Utc>>()?.to_sql(ty, out)
                } else {
                    s.as_str().to_sql(ty, out)
                }
            }
            Value::Bytes(b) => b.as_slice().to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn decode(row: &Row, idx: usize) -> Result<Value, postgres::Error> {
    let ty = row.columns()[idx].type_();

    let value = if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool)
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)?.map(|v| Value::Int(v.into()))
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)?.map(|v| Value::Int(v.into()))
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx)?.map(Value::Int)
    } else if *ty == Type::OID {
        row.try_get::<_, Option<u32>>(idx)?.map(|v| Value::Int(v.into()))
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)?.map(|v| Value::Float(v.into()))
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx)?.map(Value::Float)
    } else if *ty == Type::UUID {
        row.try_get::<_, Option<uuid::Uuid>>(idx)?.map(Value::from)
    } else if *ty == Type::TIMESTAMPTZ {
        row.try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|v| Value::Text(v.to_rfc3339()))
    } else if *ty == Type::TIMESTAMP {
        row.try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(|v| Value::Text(v.to_string()))
    } else if *ty == Type::DATE {
        row.try_get::<_, Option<NaiveDate>>(idx)?
            .map(|v| Value::Text(v.to_string()))
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        row.try_get::<_, Option<serde_json::Value>>(idx)?
            .map(|v| Value::Text(v.to_string()))
    } else if *ty == Type::BYTEA {
        row.try_get::<_, Option<Vec<u8>>>(idx)?.map(Value::Bytes)
    } else {
        // Text-like types; anything else surfaces as a WrongType error.
        row.try_get::<_, Option<String>>(idx)?.map(Value::Text)
    };

    Ok(value.unwrap_or(Value::Null))
}

impl From<postgres::Error> for DriverError {
    fn from(err: postgres::Error) -> Self {
        match err.as_db_error() {
            Some(db) => DriverError {
                code: db.code().code().to_string(),
                message: db.message().to_string(),
                detail: db.detail().map(str::to_string),
                hint: db.hint().map(str::to_string),
                position: match db.position() {
                    Some(ErrorPosition::Original(position)) => Some(*position),
                    _ => None,
                },
            },
            None if err.is_closed() => DriverError::new(CONNECTION_FAILURE, err.to_string()),
            None => DriverError::new(INTERNAL_ERROR, err.to_string()),
        }
    }
}

impl Session for Client {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn run(&mut self, stmt: &Statement) -> Result<Rows, DriverError> {
        let prepared = self.prepare(stmt.text())?;
        let params: Vec<&(dyn ToSql + Sync)> = stmt
            .params()
            .iter()
            .map(|v| v as &(dyn ToSql + Sync))
            .collect();

        if prepared.columns().is_empty() {
            let affected = self.execute(&prepared, &params)?;
            return Ok(Rows::affected(affected));
        }

        let columns: Vec<String> = prepared
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        let rows = self.query(&prepared, &params)?;
        let mut values = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = (0..columns.len())
                .map(|idx| decode(row, idx))
                .collect::<Result<Vec<_>, _>>()?;
            values.push(record);
        }

        Ok(Rows::from_values(columns, values))
    }

    fn run_script(&mut self, sql: &str) -> Result<(), DriverError> {
        self.batch_execute(sql).map_err(DriverError::from)
    }

    fn is_closed(&self) -> bool {
        Client::is_closed(self)
    }
}
