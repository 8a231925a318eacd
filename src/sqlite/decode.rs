//! JSON <-> SQLite value conversion

use base64::Engine;
use serde_json::Value as JsonValue;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow, SqliteValueRef};
use sqlx::{Column, Row as _, Sqlite, TypeInfo, Value, ValueRef};
use time::PrimitiveDateTime;

use crate::statement::Row;
use crate::{Error, Result};

/// Binds one JSON value as the next positional parameter.
///
/// Integers keep their precision when they fit in `i64`. Arrays and objects
/// are bound as JSON text.
pub(crate) fn bind_value<'q>(
   query: Query<'q, Sqlite, SqliteArguments<'q>>,
   value: &JsonValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
   match value {
      JsonValue::Null => query.bind(None::<i64>),
      JsonValue::Bool(b) => query.bind(*b),
      JsonValue::String(s) => query.bind(s.clone()),
      JsonValue::Number(n) => {
         if let Some(int) = n.as_i64() {
            query.bind(int)
         } else if let Some(uint) = n.as_u64()
            && let Ok(int) = i64::try_from(uint)
         {
            query.bind(int)
         } else {
            // Larger than i64::MAX or fractional; stored as REAL
            query.bind(n.as_f64().unwrap_or_default())
         }
      }
      other => query.bind(other.clone()),
   }
}

/// Decodes every column of `row`, in select order.
pub(crate) fn decode_row(row: &SqliteRow) -> Result<Row> {
   let mut decoded = Row::with_capacity(row.columns().len());
   for (i, column) in row.columns().iter().enumerate() {
      decoded.insert(column.name().to_string(), to_json(row.try_get_raw(i)?)?);
   }
   Ok(decoded)
}

/// Converts a SQLite value to JSON by its storage class.
///
/// BLOBs become base64 strings. Declared DATETIME columns are normalized when
/// they parse, otherwise returned as stored.
pub(crate) fn to_json(value: SqliteValueRef<'_>) -> Result<JsonValue> {
   if value.is_null() {
      return Ok(JsonValue::Null);
   }

   let owned = value.to_owned();
   let type_name = value.type_info().name().to_string();

   let decoded = match type_name.as_str() {
      "NULL" => JsonValue::Null,
      "INTEGER" | "NUMERIC" => owned
         .try_decode::<i64>()
         .map(JsonValue::from)
         .unwrap_or(JsonValue::Null),
      "REAL" => owned
         .try_decode::<f64>()
         .map(JsonValue::from)
         .unwrap_or(JsonValue::Null),
      "BOOLEAN" => owned
         .try_decode::<bool>()
         .map(JsonValue::Bool)
         .unwrap_or(JsonValue::Null),
      "BLOB" => owned
         .try_decode::<Vec<u8>>()
         .map(|blob| JsonValue::String(base64_encode(&blob)))
         .unwrap_or(JsonValue::Null),
      "DATETIME" => match owned.try_decode::<PrimitiveDateTime>() {
         Ok(datetime) => JsonValue::String(datetime.to_string()),
         Err(_) => owned
            .try_decode::<String>()
            .map(JsonValue::String)
            .unwrap_or(JsonValue::Null),
      },
      // TEXT, DATE, TIME and anything declared with a custom type name
      _ => owned
         .try_decode::<String>()
         .map(JsonValue::String)
         .map_err(|_| Error::UnsupportedDatatype(type_name.clone()))?,
   };

   Ok(decoded)
}

fn base64_encode(data: &[u8]) -> String {
   base64::engine::general_purpose::STANDARD.encode(data)
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_base64_encode() {
      assert_eq!(base64_encode(b"hello"), "aGVsbG8=");
      assert_eq!(base64_encode(&[0, 0, 0]), "AAAA");
      assert_eq!(base64_encode(&[255, 255, 255]), "////");
      assert_eq!(base64_encode(&[]), "");
   }
}
