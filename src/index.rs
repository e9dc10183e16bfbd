//! Workbook indexing.
//!
//! Turns an uploaded workbook into a session directory under the workspace
//! root:
//!
//! ```text
//! <root>/<session>/
//!   <workbook>.xlsx      original upload
//!   metadata.json        WorkbookIndex (session_id set once complete)
//!   sheet_<name>_<n>.png small-sheet page images
//!   <sheet>.csv          big-sheet cell text
//!   sample_sheet_*.png   big-sheet sample images
//!   workbook.db          SQLite store, one table per big sheet
//! ```
//!
//! Indexing is idempotent per content: a byte-identical upload whose earlier
//! indexing completed returns the existing session without reconverting.

use anyhow::{Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::IndexingConfig;
use crate::error::PipelineError;
use crate::models::{BigSheetTable, SheetImage, WorkbookIndex};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::render::{file_safe, read_data_url, SheetPage, SheetRenderer};
use crate::store::{RelationalStore, STORE_FILE};
use crate::tabular::Dataset;
use crate::workbook::{SheetKind, Workbook};

pub const METADATA_FILE: &str = "metadata.json";

pub fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn session_dir(root: &Path, session_id: &str) -> PathBuf {
    root.join(session_id)
}

/// Loads a session's index, rejecting unknown and unfinished sessions.
pub fn load_index(root: &Path, session_id: &str) -> crate::error::Result<WorkbookIndex> {
    // session ids are directory names; refuse anything that could escape the root
    if session_id.is_empty()
        || session_id.contains(['/', '\\'])
        || session_id == "."
        || session_id == ".."
    {
        return Err(PipelineError::SessionNotFound(session_id.to_string()));
    }
    let path = session_dir(root, session_id).join(METADATA_FILE);
    let content = std::fs::read_to_string(&path)
        .map_err(|_| PipelineError::SessionNotFound(session_id.to_string()))?;
    let index: WorkbookIndex = serde_json::from_str(&content)
        .map_err(|e| PipelineError::Dataset(format!("{}: {}", path.display(), e)))?;
    if !index.is_complete() {
        return Err(PipelineError::IndexIncomplete(session_id.to_string()));
    }
    Ok(index)
}

/// Writes metadata through a temporary file and a rename, so readers never
/// see a half-written record.
fn write_metadata(dir: &Path, index: &WorkbookIndex) -> Result<()> {
    let tmp = dir.join(format!("{}.tmp", METADATA_FILE));
    let json = serde_json::to_string_pretty(index)?;
    std::fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, dir.join(METADATA_FILE))
        .with_context(|| format!("Failed to finalize metadata in {}", dir.display()))?;
    Ok(())
}

/// Finds a completed session indexed from the same bytes.
fn find_existing(root: &Path, fingerprint: &str) -> Option<WorkbookIndex> {
    let entries = std::fs::read_dir(root).ok()?;
    entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| std::fs::read_to_string(e.path().join(METADATA_FILE)).ok())
        .filter_map(|content| serde_json::from_str::<WorkbookIndex>(&content).ok())
        .find(|index| index.is_complete() && index.fingerprint == fingerprint)
}

pub struct Indexer {
    root: PathBuf,
    config: IndexingConfig,
    renderer: Arc<dyn SheetRenderer>,
}

impl Indexer {
    pub fn new(root: impl Into<PathBuf>, config: IndexingConfig, renderer: Arc<dyn SheetRenderer>) -> Self {
        Self {
            root: root.into(),
            config,
            renderer,
        }
    }

    /// Indexes a workbook and emits `Indexed` on success or `Error` on failure.
    pub async fn index_workbook(
        &self,
        filename: &str,
        bytes: &[u8],
        progress: &dyn ProgressSink,
    ) -> Result<WorkbookIndex> {
        match self.run(filename, bytes, progress).await {
            Ok(index) => {
                if let Some(id) = &index.session_id {
                    progress.emit(ProgressEvent::Indexed(id.clone()));
                }
                Ok(index)
            }
            Err(e) => {
                progress.emit(ProgressEvent::Error(format!("{:#}", e)));
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        filename: &str,
        bytes: &[u8],
        progress: &dyn ProgressSink,
    ) -> Result<WorkbookIndex> {
        progress.emit(ProgressEvent::Status(
            "Uploading the workbook. Please wait!".to_string(),
        ));
        let fingerprint = fingerprint(bytes);
        if let Some(existing) = find_existing(&self.root, &fingerprint) {
            info!(session = ?existing.session_id, "workbook already indexed");
            return Ok(existing);
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let dir = session_dir(&self.root, &session_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create session directory: {}", dir.display()))?;
        let workbook_path = dir.join(workbook_file_name(filename));
        std::fs::write(&workbook_path, bytes)
            .with_context(|| format!("Failed to save workbook: {}", workbook_path.display()))?;

        let mut index = WorkbookIndex {
            fingerprint,
            session_id: None,
            workbook_path: workbook_path.clone(),
            small_sheet_images: None,
            big_sheet_tables: None,
            relational_store_path: None,
            indexed_at: None,
        };
        write_metadata(&dir, &index)?;
        info!(session = %session_id, file = %filename, "indexing workbook");

        let workbook = Workbook::from_bytes(bytes).context("Failed to read workbook")?;
        progress.emit(ProgressEvent::Status(
            "Indexing: Workbook uploaded, now processing sheets. Please wait!".to_string(),
        ));

        let mut small = Vec::new();
        let mut big = Vec::new();
        for (position, sheet) in workbook.sheets.iter().enumerate() {
            let page = SheetPage {
                sheet_name: sheet.name.clone(),
                page: position + 1,
            };
            match sheet.classify(self.config.small_max_rows, self.config.small_max_cols) {
                SheetKind::Small => small.push(page),
                SheetKind::Big => big.push((page, sheet)),
                SheetKind::Empty => info!(sheet = %sheet.name, "skipping empty sheet"),
            }
        }

        if !small.is_empty() {
            progress.emit(ProgressEvent::Status(
                "Indexing: Processing small sheets. Please wait!".to_string(),
            ));
            index.small_sheet_images = Some(self.render_small(&workbook_path, small, &dir).await);
        }

        if !big.is_empty() {
            progress.emit(ProgressEvent::Status(
                "Indexing: Processing big sheets. Please wait!".to_string(),
            ));
            let store_path = dir.join(STORE_FILE);
            let store = RelationalStore::create(&store_path).await?;
            let mut tables = Vec::new();
            for (page, sheet) in big {
                let dataset = Dataset::from_grid(&sheet.name, &sheet.rows);
                let tabular_path = dir.join(format!("{}.csv", file_safe(&sheet.name)));
                dataset.write_csv(&tabular_path)?;
                let sample_image = self
                    .render_sample(dataset.head(self.config.sample_rows), page.page, &dir)
                    .await;
                store.materialize(&dataset).await?;
                info!(
                    table = %dataset.name,
                    rows = dataset.rows.len(),
                    columns = dataset.columns.len(),
                    "materialized big sheet"
                );
                tables.push(BigSheetTable {
                    table_name: dataset.name.clone(),
                    tabular_path,
                    sample_image,
                });
            }
            store.close().await;
            index.big_sheet_tables = Some(tables);
            index.relational_store_path = Some(store_path);
        }

        progress.emit(ProgressEvent::Status(format!(
            "Indexing: Processed and encoded all sheets. Saving metadata for user {}. Please wait!",
            session_id
        )));
        index.session_id = Some(session_id.clone());
        index.indexed_at = Some(Utc::now());
        write_metadata(&dir, &index)?;
        info!(session = %session_id, "workbook indexed");
        Ok(index)
    }

    async fn render_small(&self, workbook: &Path, pages: Vec<SheetPage>, dir: &Path) -> Vec<SheetImage> {
        let renderer = self.renderer.clone();
        let workbook = workbook.to_path_buf();
        let out_dir = dir.to_path_buf();
        let rendered = tokio::task::spawn_blocking(move || {
            renderer.render_pages(&workbook, &pages, &out_dir)
        })
        .await;
        let rendered = match rendered {
            Ok(Ok(rendered)) => rendered,
            Ok(Err(e)) => {
                warn!(error = %e, "small sheet rendering failed");
                return Vec::new();
            }
            Err(e) => {
                warn!(error = %e, "small sheet rendering task failed");
                return Vec::new();
            }
        };
        rendered
            .into_iter()
            .filter_map(|(page, path)| match read_data_url(&path) {
                Ok(data_url) => Some(SheetImage {
                    sheet_name: page.sheet_name,
                    image_path: path,
                    data_url,
                }),
                Err(e) => {
                    warn!(sheet = %page.sheet_name, error = %e, "rendered page unreadable");
                    None
                }
            })
            .collect()
    }

    async fn render_sample(&self, sample: Dataset, page: usize, dir: &Path) -> Option<PathBuf> {
        let renderer = self.renderer.clone();
        let out_dir = dir.to_path_buf();
        let name = sample.name.clone();
        match tokio::task::spawn_blocking(move || renderer.render_sample(&sample, page, &out_dir)).await {
            Ok(Ok(path)) => path,
            Ok(Err(e)) => {
                warn!(sheet = %name, error = %e, "sample image rendering failed");
                None
            }
            Err(e) => {
                warn!(sheet = %name, error = %e, "sample image task failed");
                None
            }
        }
    }
}

fn workbook_file_name(filename: &str) -> String {
    let base = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("workbook.xlsx");
    file_safe(base)
}
