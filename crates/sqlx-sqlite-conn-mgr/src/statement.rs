//! Multi-row INSERT construction for batch inserts

use serde_json::Value as JsonValue;

use crate::{Error, Result};

/// Validate a table or column name for interpolation into SQL.
///
/// Accepts `[a-zA-Z_][a-zA-Z0-9_]*`. Names are also quoted on output, so this
/// is the first of two layers.
pub(crate) fn validate_identifier(name: &str) -> Result<()> {
   let mut chars = name.chars();
   let valid = match chars.next() {
      Some(first) => {
         (first.is_ascii_alphabetic() || first == '_')
            && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
      }
      None => false,
   };

   if valid {
      Ok(())
   } else {
      Err(Error::InvalidIdentifier(name.to_string()))
   }
}

/// Quote an identifier with double quotes, doubling any embedded quotes.
pub(crate) fn quote_identifier(name: &str) -> String {
   format!("\"{}\"", name.replace('"', "\"\""))
}

/// Build one `INSERT ... VALUES (...), (...)` statement covering every row,
/// with the row values flattened into a single positional parameter list.
///
/// SQLite caps a statement at 32766 bound variables; larger inserts fail at
/// execution time like any other statement error.
pub fn build_batch_insert(
   table: &str,
   columns: &[String],
   rows: Vec<Vec<JsonValue>>,
) -> Result<(String, Vec<JsonValue>)> {
   validate_identifier(table)?;
   if columns.is_empty() {
      return Err(Error::InvalidIdentifier(String::new()));
   }
   for column in columns {
      validate_identifier(column)?;
   }

   for (i, row) in rows.iter().enumerate() {
      if row.len() != columns.len() {
         return Err(Error::RowWidthMismatch {
            row: i,
            expected: columns.len(),
            actual: row.len(),
         });
      }
   }

   let column_list = columns
      .iter()
      .map(|c| quote_identifier(c))
      .collect::<Vec<_>>()
      .join(", ");

   let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
   let values_clause = vec![placeholders.as_str(); rows.len()].join(", ");

   let sql = format!(
      "INSERT INTO {} ({}) VALUES {}",
      quote_identifier(table),
      column_list,
      values_clause
   );

   let params = rows.into_iter().flatten().collect();
   Ok((sql, params))
}

#[cfg(test)]
mod tests {
   use super::*;
   use serde_json::json;

   #[test]
   fn identifier_valid() {
      assert!(validate_identifier("odds").is_ok());
      assert!(validate_identifier("_race_id2").is_ok());
   }

   #[test]
   fn identifier_rejects_empty_and_injection() {
      assert!(validate_identifier("").is_err());
      assert!(validate_identifier("1abc").is_err());
      assert!(validate_identifier("odds; DROP TABLE races").is_err());
      assert!(validate_identifier("a\"b").is_err());
      assert!(validate_identifier("main.odds").is_err());
   }

   #[test]
   fn builds_single_statement_for_all_rows() {
      let columns = vec!["race_id".to_string(), "win_odds".to_string()];
      let (sql, params) = build_batch_insert(
         "odds",
         &columns,
         vec![
            vec![json!("r1"), json!(2.5)],
            vec![json!("r2"), json!(7.1)],
            vec![json!("r3"), json!(12.0)],
         ],
      )
      .unwrap();

      assert_eq!(
         sql,
         "INSERT INTO \"odds\" (\"race_id\", \"win_odds\") VALUES (?, ?), (?, ?), (?, ?)"
      );
      assert_eq!(params.len(), 6);
      assert_eq!(params[2], json!("r2"));
   }

   #[test]
   fn rejects_ragged_rows() {
      let columns = vec!["a".to_string(), "b".to_string()];
      let err = build_batch_insert("t", &columns, vec![vec![json!(1), json!(2)], vec![json!(3)]])
         .unwrap_err();

      assert!(matches!(
         err,
         Error::RowWidthMismatch {
            row: 1,
            expected: 2,
            actual: 1
         }
      ));
   }

   #[test]
   fn rejects_empty_column_list() {
      assert!(build_batch_insert("t", &[], vec![vec![]]).is_err());
   }
}
