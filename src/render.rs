//! Sheet rendering.
//!
//! Small sheets are shown to the vision check as page images of the whole
//! workbook; big sheets get one sample image of their first rows for the SQL
//! generator. [`ExternalRenderer`] shells out to LibreOffice and ImageMagick;
//! [`NoopRenderer`] renders nothing and is used when those binaries are not
//! installed (and in tests).

use anyhow::{bail, Context, Result};
use base64::Engine;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::IndexingConfig;
use crate::tabular::Dataset;

/// A sheet and its 1-based page in the workbook PDF (sheet position + 1).
#[derive(Debug, Clone, PartialEq)]
pub struct SheetPage {
    pub sheet_name: String,
    pub page: usize,
}

pub trait SheetRenderer: Send + Sync {
    /// Renders the listed pages of the workbook into `out_dir`. Pages that
    /// fail to render are left out of the result.
    fn render_pages(&self, workbook: &Path, pages: &[SheetPage], out_dir: &Path)
        -> Result<Vec<(SheetPage, PathBuf)>>;

    /// Renders a sample of a big sheet to an image.
    fn render_sample(&self, sample: &Dataset, page: usize, out_dir: &Path)
        -> Result<Option<PathBuf>>;
}

pub fn renderer_from_config(config: &IndexingConfig) -> Box<dyn SheetRenderer> {
    match config.renderer.as_str() {
        "none" => Box::new(NoopRenderer),
        _ => Box::new(ExternalRenderer {
            soffice_bin: config.soffice_bin.clone(),
            convert_bin: config.convert_bin.clone(),
        }),
    }
}

pub struct NoopRenderer;

impl SheetRenderer for NoopRenderer {
    fn render_pages(
        &self,
        _workbook: &Path,
        _pages: &[SheetPage],
        _out_dir: &Path,
    ) -> Result<Vec<(SheetPage, PathBuf)>> {
        Ok(Vec::new())
    }

    fn render_sample(&self, _sample: &Dataset, _page: usize, _out_dir: &Path) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}

pub struct ExternalRenderer {
    pub soffice_bin: String,
    pub convert_bin: String,
}

impl ExternalRenderer {
    /// Converts `input` with LibreOffice into `out_dir`, returning the output path.
    fn soffice(&self, input: &Path, filter: &str, extension: &str, out_dir: &Path) -> Result<PathBuf> {
        let output = Command::new(&self.soffice_bin)
            .args(["--headless", "--convert-to", filter])
            .arg(input)
            .arg("--outdir")
            .arg(out_dir)
            .output()
            .with_context(|| format!("Failed to execute '{}'. Is LibreOffice installed?", self.soffice_bin))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("soffice failed: {}", stderr.trim());
        }
        let stem = input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("workbook");
        let produced = out_dir.join(format!("{}.{}", stem, extension));
        if !produced.exists() {
            bail!("soffice produced no output for {}", input.display());
        }
        Ok(produced)
    }

    fn pdf_page_to_png(&self, pdf: &Path, page: usize, out: &Path) -> Result<()> {
        let output = Command::new(&self.convert_bin)
            .args(["-density", "300", "-trim", "-quality", "100"])
            .arg(format!("{}[{}]", pdf.display(), page.saturating_sub(1)))
            .arg(out)
            .output()
            .with_context(|| format!("Failed to execute '{}'. Is ImageMagick installed?", self.convert_bin))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("convert failed: {}", stderr.trim());
        }
        if !out.exists() {
            bail!("convert produced no image for page {}", page);
        }
        Ok(())
    }
}

impl SheetRenderer for ExternalRenderer {
    fn render_pages(
        &self,
        workbook: &Path,
        pages: &[SheetPage],
        out_dir: &Path,
    ) -> Result<Vec<(SheetPage, PathBuf)>> {
        let pdf = self.soffice(
            workbook,
            r#"pdf:calc_pdf_Export:{"SinglePageSheets":{"type":"boolean","value":"true"}}"#,
            "pdf",
            out_dir,
        )?;
        let mut out = Vec::new();
        for page in pages {
            let png = out_dir.join(format!("sheet_{}_{}.png", file_safe(&page.sheet_name), page.page));
            match self.pdf_page_to_png(&pdf, page.page, &png) {
                Ok(()) => out.push((page.clone(), png)),
                Err(e) => tracing::warn!(sheet = %page.sheet_name, error = %e, "page render failed"),
            }
        }
        Ok(out)
    }

    fn render_sample(&self, sample: &Dataset, page: usize, out_dir: &Path) -> Result<Option<PathBuf>> {
        let name = format!("sample_sheet_{}_{}", file_safe(&sample.name), page);
        let csv = out_dir.join(format!("{}.csv", name));
        sample.write_csv(&csv)?;
        let pdf = self.soffice(&csv, "pdf", "pdf", out_dir)?;
        let png = out_dir.join(format!("{}.png", name));
        self.pdf_page_to_png(&pdf, 1, &png)?;
        let _ = std::fs::remove_file(&csv);
        let _ = std::fs::remove_file(&pdf);
        Ok(Some(png))
    }
}

/// Sheet names may contain path separators; keep file names flat.
pub fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

pub fn png_data_url(bytes: &[u8]) -> String {
    format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

pub fn read_data_url(path: &Path) -> Result<String> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read image: {}", path.display()))?;
    Ok(png_data_url(&bytes))
}
