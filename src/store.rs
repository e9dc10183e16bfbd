//! SQLite relational store holding one table per big sheet.
//!
//! Indexing opens the store writable and materializes every [`Dataset`].
//! Question time opens it read-only, with a fresh pool per question, so a
//! generated statement cannot modify the indexed data.

use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use std::path::Path;
use std::str::FromStr;

use crate::error::{PipelineError, Result};
use crate::models::ColumnInfo;
use crate::tabular::{Dataset, SqlType};

/// Name of the store file inside a session directory.
pub const STORE_FILE: &str = "workbook.db";

/// Double-quotes an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub struct RelationalStore {
    pool: SqlitePool,
}

impl RelationalStore {
    /// Creates (or reopens) a writable store at `path`.
    pub async fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PipelineError::Dataset(format!("{}: {}", parent.display(), e)))?;
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Opens an existing store read-only.
    pub async fn open_read_only(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Replaces the table named after the dataset with its rows. Blank cells
    /// are stored as NULL; numeric columns are bound as numbers.
    pub async fn materialize(&self, dataset: &Dataset) -> Result<()> {
        let table = quote_ident(&dataset.name);
        let types = dataset.column_types();
        let column_defs: Vec<String> = dataset
            .columns
            .iter()
            .zip(&types)
            .map(|(name, ty)| format!("{} {}", quote_ident(name), ty.as_sql()))
            .collect();

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("CREATE TABLE {} ({})", table, column_defs.join(", ")))
            .execute(&mut *tx)
            .await?;

        if !dataset.columns.is_empty() {
            let placeholders = vec!["?"; dataset.columns.len()].join(", ");
            let insert = format!("INSERT INTO {} VALUES ({})", table, placeholders);
            for row in &dataset.rows {
                let mut query = sqlx::query(&insert);
                for (cell, ty) in row.iter().zip(&types) {
                    let cell = cell.trim();
                    query = match (cell.is_empty(), ty) {
                        (true, _) => query.bind(Option::<String>::None),
                        (false, SqlType::Integer) => match cell.parse::<i64>() {
                            Ok(v) => query.bind(v),
                            Err(_) => query.bind(cell.to_string()),
                        },
                        (false, SqlType::Real) => match cell.parse::<f64>() {
                            Ok(v) => query.bind(v),
                            Err(_) => query.bind(cell.to_string()),
                        },
                        (false, SqlType::Text) => query.bind(cell.to_string()),
                    };
                }
                query.execute(&mut *tx).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Column names and declared types, in table order.
    pub async fn describe(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let rows = sqlx::query(&format!("PRAGMA table_info({})", quote_ident(table)))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<ColumnInfo> {
                Ok(ColumnInfo {
                    name: row.try_get::<String, _>("name")?,
                    column_type: row.try_get::<String, _>("type")?,
                })
            })
            .collect()
    }

    pub async fn table_names(&self) -> Result<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY rowid",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    /// Runs one statement and returns its rows as JSON values, one inner
    /// vector per row in column order.
    pub async fn execute(&self, sql: &str) -> Result<Vec<Vec<Value>>> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PipelineError::QueryExecution(e.to_string()))?;
        rows.iter().map(row_to_values).collect()
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

fn row_to_values(row: &SqliteRow) -> Result<Vec<Value>> {
    (0..row.columns().len())
        .map(|i| -> Result<Value> {
            let raw = row.try_get_raw(i)?;
            if raw.is_null() {
                return Ok(Value::Null);
            }
            let type_name = raw.type_info().name().to_string();
            let value = match type_name.as_str() {
                "INTEGER" | "BOOLEAN" => Value::from(row.try_get_unchecked::<i64, _>(i)?),
                "REAL" => serde_json::Number::from_f64(row.try_get_unchecked::<f64, _>(i)?)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                "BLOB" => Value::String(hex::encode(row.try_get_unchecked::<Vec<u8>, _>(i)?)),
                _ => Value::String(row.try_get_unchecked::<String, _>(i)?),
            };
            Ok(value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tenders() -> Dataset {
        Dataset {
            name: "Tender \"List\"".into(),
            columns: vec!["Title".into(), "Year".into(), "Value".into()],
            rows: vec![
                vec!["Lulu at Palm Mall".into(), "2016".into(), "152138.798".into()],
                vec!["Roads Phase 1".into(), "2016".into(), "".into()],
                vec!["Fishery Harbour".into(), "2018".into(), "90.5".into()],
            ],
        }
    }

    #[test]
    fn quote_ident_doubles_quotes() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(quote_ident("Issue Date"), "\"Issue Date\"");
    }

    #[tokio::test]
    async fn materialize_then_describe_and_query() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join(STORE_FILE);
        let store = RelationalStore::create(&path).await.unwrap();
        store.materialize(&tenders()).await.unwrap();

        let cols = store.describe("Tender \"List\"").await.unwrap();
        let types: Vec<_> = cols.iter().map(|c| c.column_type.as_str()).collect();
        assert_eq!(types, vec!["TEXT", "INTEGER", "REAL"]);

        let rows = store
            .execute("SELECT COUNT(*) FROM \"Tender \"\"List\"\"\" WHERE \"Year\" = 2016")
            .await
            .unwrap();
        assert_eq!(rows, vec![vec![json!(2)]]);

        let rows = store
            .execute("SELECT \"Value\" FROM \"Tender \"\"List\"\"\" WHERE \"Title\" = 'Roads Phase 1'")
            .await
            .unwrap();
        assert_eq!(rows, vec![vec![Value::Null]]);
        store.close().await;
    }

    #[tokio::test]
    async fn materialize_replaces_existing_table() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = RelationalStore::create(&tmp.path().join(STORE_FILE))
            .await
            .unwrap();
        store.materialize(&tenders()).await.unwrap();
        store.materialize(&tenders().head(1)).await.unwrap();
        let rows = store
            .execute("SELECT COUNT(*) FROM \"Tender \"\"List\"\"\"")
            .await
            .unwrap();
        assert_eq!(rows, vec![vec![json!(1)]]);
        assert_eq!(store.table_names().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn bad_statement_is_query_execution_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = RelationalStore::create(&tmp.path().join(STORE_FILE))
            .await
            .unwrap();
        let err = store.execute("SELECT * FROM missing").await.unwrap_err();
        assert_eq!(err.code(), "query_execution");
    }

    #[tokio::test]
    async fn read_only_store_rejects_writes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join(STORE_FILE);
        let store = RelationalStore::create(&path).await.unwrap();
        store.materialize(&tenders()).await.unwrap();
        store.close().await;

        let ro = RelationalStore::open_read_only(&path).await.unwrap();
        assert!(ro
            .execute("DELETE FROM \"Tender \"\"List\"\"\"")
            .await
            .is_err());
        let rows = ro
            .execute("SELECT COUNT(*) FROM \"Tender \"\"List\"\"\"")
            .await
            .unwrap();
        assert_eq!(rows, vec![vec![json!(3)]]);
    }
}
