//! Binding JSON parameters to statements and decoding rows back to JSON

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteArguments, SqliteRow, SqliteValueRef};
use sqlx::{Column, Row as _, Sqlite, TypeInfo, Value as _, ValueRef};

use crate::{Error, Result};

/// A decoded result row, keyed by column name in select order
pub type Row = IndexMap<String, JsonValue>;

pub type SqliteQuery<'a> = sqlx::query::Query<'a, Sqlite, SqliteArguments<'a>>;

/// Result returned from write operations (e.g. INSERT, UPDATE, DELETE).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
   /// The number of rows affected by the write operation.
   pub rows_affected: u64,
   /// The last inserted row ID (SQLite ROWID).
   ///
   /// Only meaningful for INSERT operations on tables with a ROWID. For
   /// parameter lists executed row by row this is the ID from the last row.
   pub last_insert_id: i64,
}

/// Bound parameters for one write operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Params {
   /// One tuple of values, executed once
   Single(Vec<JsonValue>),
   /// A list of tuples; the statement is executed once per tuple inside the
   /// same savepoint, so either every tuple applies or none does
   Batch(Vec<Vec<JsonValue>>),
}

impl Params {
   /// Number of times the statement will be executed
   pub fn executions(&self) -> usize {
      match self {
         Params::Single(_) => 1,
         Params::Batch(rows) => rows.len(),
      }
   }
}

impl Default for Params {
   fn default() -> Self {
      Params::Single(Vec::new())
   }
}

impl From<Vec<JsonValue>> for Params {
   fn from(values: Vec<JsonValue>) -> Self {
      Params::Single(values)
   }
}

impl From<Vec<Vec<JsonValue>>> for Params {
   fn from(rows: Vec<Vec<JsonValue>>) -> Self {
      Params::Batch(rows)
   }
}

/// Build a query with every value bound in order
pub fn bind_all(query: &str, values: Vec<JsonValue>) -> SqliteQuery<'_> {
   let mut q = sqlx::query(query);
   for value in values {
      q = bind_value(q, value);
   }
   q
}

/// Bind a JSON value to a SQLx query
pub(crate) fn bind_value(query: SqliteQuery<'_>, value: JsonValue) -> SqliteQuery<'_> {
   match value {
      JsonValue::Null => query.bind(None::<JsonValue>),
      JsonValue::Bool(b) => query.bind(b),
      JsonValue::String(s) => query.bind(s),
      JsonValue::Number(number) => {
         // Preserve integer precision by binding as i64 when possible
         if let Some(int_val) = number.as_i64() {
            query.bind(int_val)
         } else if let Some(uint_val) = number.as_u64() {
            // Larger than i64::MAX; SQLite has no unsigned INTEGER
            query.bind(uint_val as f64)
         } else {
            query.bind(number.as_f64().unwrap_or_default())
         }
      }
      other => query.bind(other),
   }
}

/// Decode fetched rows into column-ordered JSON maps
pub fn decode_rows(rows: Vec<SqliteRow>) -> Result<Vec<Row>> {
   let mut decoded = Vec::with_capacity(rows.len());
   for row in rows {
      let mut value = Row::default();
      for (i, column) in row.columns().iter().enumerate() {
         let v = row.try_get_raw(i)?;
         value.insert(column.name().to_string(), to_json(v)?);
      }
      decoded.push(value);
   }
   Ok(decoded)
}

/// Convert one SQLite value to JSON. BLOBs become base64 text.
pub(crate) fn to_json(v: SqliteValueRef<'_>) -> Result<JsonValue> {
   if v.is_null() {
      return Ok(JsonValue::Null);
   }

   let type_name = v.type_info().name().to_string();
   let owned = ValueRef::to_owned(&v);

   let json = match type_name.as_str() {
      "TEXT" | "DATE" | "TIME" | "DATETIME" => {
         JsonValue::String(owned.try_decode_unchecked::<String>()?)
      }
      "REAL" => {
         let f = owned.try_decode_unchecked::<f64>()?;
         serde_json::Number::from_f64(f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)
      }
      "INTEGER" | "NUMERIC" | "BOOLEAN" => {
         JsonValue::from(owned.try_decode_unchecked::<i64>()?)
      }
      "BLOB" => {
         let bytes = owned.try_decode_unchecked::<Vec<u8>>()?;
         JsonValue::String(BASE64.encode(bytes))
      }
      other => return Err(Error::UnsupportedDatatype(other.to_string())),
   };

   Ok(json)
}

#[cfg(test)]
mod tests {
   use super::*;
   use serde_json::json;

   #[test]
   fn test_params_executions() {
      assert_eq!(Params::from(vec![json!(1)]).executions(), 1);
      assert_eq!(
         Params::from(vec![vec![json!(1)], vec![json!(2)], vec![json!(3)]]).executions(),
         3
      );
      assert_eq!(Params::default(), Params::Single(vec![]));
   }

   #[tokio::test]
   async fn test_decode_types() {
      use sqlx::Connection;

      let mut conn = sqlx::SqliteConnection::connect("sqlite::memory:").await.unwrap();
      let q = bind_all(
         "SELECT ? AS n, ? AS t, ? AS r, ? AS big, X'48656C6C6F' AS b, NULL AS z",
         vec![json!(7), json!("hi"), json!(1.5), json!(9_007_199_254_740_992_i64)],
      );
      let rows = q.fetch_all(&mut conn).await.unwrap();
      let rows = decode_rows(rows).unwrap();

      let row = &rows[0];
      let keys: Vec<&String> = row.keys().collect();
      assert_eq!(keys, vec!["n", "t", "r", "big", "b", "z"]);
      assert_eq!(row["n"], json!(7));
      assert_eq!(row["t"], json!("hi"));
      assert_eq!(row["r"], json!(1.5));
      assert_eq!(row["big"], json!(9_007_199_254_740_992_i64));
      assert_eq!(row["b"], json!("SGVsbG8="));
      assert_eq!(row["z"], JsonValue::Null);
   }
}
