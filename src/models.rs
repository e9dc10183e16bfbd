//! Core data models used throughout the workbook pipeline.
//!
//! These types represent the indexed workbook, the fuzzy-match candidates,
//! and the per-table descriptors and results that flow through a question.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Indexed representation of an uploaded workbook, persisted as
/// `metadata.json` in the session directory.
///
/// `session_id` doubles as the completion marker: it is written only after
/// every sheet has been materialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkbookIndex {
    /// SHA-256 of the raw workbook bytes.
    pub fingerprint: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub workbook_path: PathBuf,
    #[serde(default)]
    pub small_sheet_images: Option<Vec<SheetImage>>,
    #[serde(default)]
    pub big_sheet_tables: Option<Vec<BigSheetTable>>,
    #[serde(default)]
    pub relational_store_path: Option<PathBuf>,
    #[serde(default)]
    pub indexed_at: Option<DateTime<Utc>>,
}

impl WorkbookIndex {
    pub fn is_complete(&self) -> bool {
        self.session_id.as_deref().is_some_and(|s| !s.is_empty())
    }

    pub fn small_sheets(&self) -> Option<&[SheetImage]> {
        self.small_sheet_images
            .as_deref()
            .filter(|images| !images.is_empty())
    }

    pub fn big_sheets(&self) -> Option<&[BigSheetTable]> {
        self.big_sheet_tables
            .as_deref()
            .filter(|tables| !tables.is_empty())
    }

    /// Big-sheet branch is available only when the tables are recorded and
    /// the relational store file is present on disk.
    pub fn has_relational_store(&self) -> bool {
        self.big_sheets().is_some()
            && self
                .relational_store_path
                .as_ref()
                .is_some_and(|p| p.exists())
    }
}

/// Rendered page of a small sheet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SheetImage {
    pub sheet_name: String,
    pub image_path: PathBuf,
    /// `data:image/png;base64,...` URL ready for a vision prompt.
    pub data_url: String,
}

/// A sheet materialized as a relational table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BigSheetTable {
    pub table_name: String,
    /// CSV copy of the sheet, scanned by the fuzzy locator.
    pub tabular_path: PathBuf,
    pub sample_image: Option<PathBuf>,
}

/// One candidate hit produced by the fuzzy locator.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FuzzyMatch {
    pub table: String,
    pub row: usize,
    pub column: String,
    pub substring: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnInfo {
    #[serde(rename = "column_name")]
    pub name: String,
    pub column_type: String,
}

/// Per-table metadata assembled for SQL generation.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDescriptor {
    pub table_name: String,
    pub columns: Vec<ColumnInfo>,
    pub sample_image: Option<PathBuf>,
}

/// One SQL statement produced for one table.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GeneratedQuery {
    pub table_name: String,
    pub sql: String,
}

/// Outcome of executing one generated statement.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum QueryOutcome {
    Rows(Vec<Vec<serde_json::Value>>),
    Error(String),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueryResult {
    pub table_name: String,
    pub query: String,
    #[serde(rename = "result")]
    pub outcome: QueryOutcome,
}

impl QueryResult {
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, QueryOutcome::Error(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> WorkbookIndex {
        WorkbookIndex {
            fingerprint: "abc".into(),
            session_id: None,
            workbook_path: PathBuf::from("book.xlsx"),
            small_sheet_images: None,
            big_sheet_tables: None,
            relational_store_path: None,
            indexed_at: None,
        }
    }

    #[test]
    fn empty_session_id_is_not_complete() {
        let mut idx = index();
        assert!(!idx.is_complete());
        idx.session_id = Some(String::new());
        assert!(!idx.is_complete());
        idx.session_id = Some("s-1".into());
        assert!(idx.is_complete());
    }

    #[test]
    fn empty_image_list_counts_as_absent() {
        let mut idx = index();
        idx.small_sheet_images = Some(vec![]);
        assert!(idx.small_sheets().is_none());
    }

    #[test]
    fn query_result_serializes_rows_or_error_under_result() {
        let ok = QueryResult {
            table_name: "Tenders".into(),
            query: "SELECT 1".into(),
            outcome: QueryOutcome::Rows(vec![vec![serde_json::json!(1)]]),
        };
        let err = QueryResult {
            table_name: "Tenders".into(),
            query: "SELEC".into(),
            outcome: QueryOutcome::Error("syntax error".into()),
        };
        let ok_json = serde_json::to_value(&ok).unwrap();
        let err_json = serde_json::to_value(&err).unwrap();
        assert_eq!(ok_json["result"], serde_json::json!([[1]]));
        assert_eq!(err_json["result"], serde_json::json!("syntax error"));
        assert!(err.is_error());
    }
}
