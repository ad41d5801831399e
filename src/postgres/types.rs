// ABOUTME: Conversions between PostgreSQL wire types and sync Values
// ABOUTME: Binds Values as parameters, narrowing integers to the column's declared width

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use std::error::Error;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::Row;
use uuid::Uuid;

use crate::value::{Record, Value};

impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(v) => v.to_sql_checked(ty, out),
            Value::Int(v) => match *ty {
                Type::INT2 => i16::try_from(*v)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*v)?.to_sql(ty, out),
                Type::NUMERIC => Decimal::from(*v).to_sql(ty, out),
                Type::FLOAT8 => (*v as f64).to_sql(ty, out),
                _ => v.to_sql_checked(ty, out),
            },
            Value::Float(v) => match *ty {
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                Type::NUMERIC => Decimal::try_from(*v)?.to_sql(ty, out),
                _ => v.to_sql_checked(ty, out),
            },
            Value::Decimal(v) => v.to_sql_checked(ty, out),
            Value::Text(v) => v.to_sql_checked(ty, out),
            Value::Json(v) => v.to_sql_checked(ty, out),
            Value::Uuid(v) => v.to_sql_checked(ty, out),
            Value::Date(v) => v.to_sql_checked(ty, out),
            Value::Time(v) => v.to_sql_checked(ty, out),
            Value::Timestamp(v) => v.to_sql_checked(ty, out),
            Value::TimestampTz(v) => v.to_sql_checked(ty, out),
        }
    }

    // Each variant checks the concrete type itself
    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Read column `idx` of `row` into a [`Value`].
///
/// Types without a `Value` variant (arrays, bytea, ranges, user-defined enums)
/// are rejected rather than silently stringified.
pub fn read_value(row: &Row, idx: usize) -> Result<Value> {
    let column = &row.columns()[idx];
    let name = column.name();
    let ty = column.type_();

    let value = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)?
            .map(|v| Value::Int(v as i64)),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)?
            .map(|v| Value::Int(v as i64)),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(Value::Int),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)?
            .map(|v| Value::Float(v as f64)),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(Value::Float),
        Type::NUMERIC => row
            .try_get::<_, Option<Decimal>>(idx)
            .with_context(|| format!("Column '{}' holds a numeric outside the supported range", name))?
            .map(Value::Decimal),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            row.try_get::<_, Option<String>>(idx)?.map(Value::Text)
        }
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map(Value::Json),
        Type::UUID => row.try_get::<_, Option<Uuid>>(idx)?.map(Value::Uuid),
        Type::DATE => row.try_get::<_, Option<NaiveDate>>(idx)?.map(Value::Date),
        Type::TIME => row.try_get::<_, Option<NaiveTime>>(idx)?.map(Value::Time),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(Value::Timestamp),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(Value::TimestampTz),
        _ => bail!("Column '{}' has unsupported type {}", name, ty),
    };

    Ok(value.unwrap_or(Value::Null))
}

/// Convert a whole row into a [`Record`] keyed by column name.
pub fn row_to_record(row: &Row) -> Result<Record> {
    let mut record = Record::new();
    for (idx, column) in row.columns().iter().enumerate() {
        record.set(column.name(), read_value(row, idx)?);
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: &Value, ty: &Type) -> std::result::Result<Vec<u8>, String> {
        let mut out = BytesMut::new();
        match value.to_sql_checked(ty, &mut out) {
            Ok(IsNull::No) => Ok(out.to_vec()),
            Ok(IsNull::Yes) => Ok(Vec::new()),
            Err(e) => Err(e.to_string()),
        }
    }

    #[test]
    fn test_int_narrows_to_column_width() {
        assert_eq!(encode(&Value::Int(7), &Type::INT2).unwrap(), vec![0, 7]);
        assert_eq!(encode(&Value::Int(7), &Type::INT4).unwrap(), vec![0, 0, 0, 7]);
        assert_eq!(encode(&Value::Int(7), &Type::INT8).unwrap().len(), 8);
    }

    #[test]
    fn test_int_overflow_is_an_error() {
        assert!(encode(&Value::Int(70_000), &Type::INT2).is_err());
    }

    #[test]
    fn test_mismatched_type_is_rejected() {
        assert!(encode(&Value::from("abc"), &Type::INT8).is_err());
        assert!(encode(&Value::Bool(true), &Type::TEXT).is_err());
    }

    #[test]
    fn test_null_binds_to_any_type() {
        let mut out = BytesMut::new();
        assert!(matches!(
            Value::Null.to_sql_checked(&Type::UUID, &mut out),
            Ok(IsNull::Yes)
        ));
    }
}
