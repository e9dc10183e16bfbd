//! Tabular datasets built from big sheets.
//!
//! A [`Dataset`] is a header row plus string cells. It is persisted as CSV
//! next to the relational store so the fuzzy locator can scan raw cell text
//! without touching SQLite.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Column affinity inferred from cell text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Integer,
    Real,
    Text,
}

impl SqlType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SqlType::Integer => "INTEGER",
            SqlType::Real => "REAL",
            SqlType::Text => "TEXT",
        }
    }
}

impl Dataset {
    /// Builds a dataset from a sheet grid. The first row is the header;
    /// columns and rows with no data are dropped.
    pub fn from_grid(name: &str, grid: &[Vec<String>]) -> Self {
        let width = grid.iter().map(|r| r.len()).max().unwrap_or(0);
        let cell = |row: &Vec<String>, c: usize| row.get(c).cloned().unwrap_or_default();

        let header: Vec<String> = match grid.first() {
            Some(first) => (0..width).map(|c| cell(first, c)).collect(),
            None => Vec::new(),
        };
        let body: Vec<Vec<String>> = grid
            .iter()
            .skip(1)
            .map(|r| (0..width).map(|c| cell(r, c)).collect())
            .collect();

        let keep: Vec<usize> = (0..width)
            .filter(|&c| body.iter().any(|r| !r[c].trim().is_empty()))
            .collect();

        let columns = dedupe_headers(
            keep.iter()
                .map(|&c| {
                    let h = header[c].trim();
                    if h.is_empty() {
                        format!("Unnamed: {}", c)
                    } else {
                        h.to_string()
                    }
                })
                .collect(),
        );

        let rows = body
            .into_iter()
            .map(|r| keep.iter().map(|&c| r[c].clone()).collect::<Vec<_>>())
            .filter(|r| r.iter().any(|v| !v.trim().is_empty()))
            .collect();

        Self {
            name: name.to_string(),
            columns,
            rows,
        }
    }

    /// First `n` rows, used for the sample image.
    pub fn head(&self, n: usize) -> Dataset {
        Dataset {
            name: self.name.clone(),
            columns: self.columns.clone(),
            rows: self.rows.iter().take(n).cloned().collect(),
        }
    }

    pub fn column_types(&self) -> Vec<SqlType> {
        (0..self.columns.len())
            .map(|c| infer_type(self.rows.iter().map(|r| r[c].as_str())))
            .collect()
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create CSV: {}", path.display()))?;
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read_csv(name: &str, path: &Path) -> Result<Dataset> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("Failed to open CSV: {}", path.display()))?;
        let columns: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            let mut row: Vec<String> = record.iter().map(|v| v.to_string()).collect();
            row.resize(columns.len(), String::new());
            rows.push(row);
        }
        Ok(Dataset {
            name: name.to_string(),
            columns,
            rows,
        })
    }
}

fn dedupe_headers(headers: Vec<String>) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    headers
        .into_iter()
        .map(|h| {
            let count = seen.entry(h.clone()).or_insert(0);
            let out = if *count == 0 {
                h.clone()
            } else {
                format!("{}.{}", h, count)
            };
            *count += 1;
            out
        })
        .collect()
}

fn infer_type<'a>(values: impl Iterator<Item = &'a str>) -> SqlType {
    let mut ty = SqlType::Integer;
    let mut any = false;
    for v in values {
        let v = v.trim();
        if v.is_empty() {
            continue;
        }
        any = true;
        if ty == SqlType::Integer && v.parse::<i64>().is_err() {
            ty = SqlType::Real;
        }
        if ty == SqlType::Real && v.parse::<f64>().is_err() {
            return SqlType::Text;
        }
    }
    if any {
        ty
    } else {
        SqlType::Text
    }
}
