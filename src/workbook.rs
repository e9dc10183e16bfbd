//! Spreadsheet reading for uploaded workbooks (OOXML `.xlsx`).
//!
//! Produces one dense string grid per worksheet, in workbook order. Sheet
//! order and names come from `xl/workbook.xml`; part paths are resolved
//! through `xl/_rels/workbook.xml.rels`. Cell values are kept as the text
//! stored in the file: shared and inline strings, `TRUE`/`FALSE` for
//! booleans, raw numeric text otherwise (date cells stay as serial numbers).

use std::collections::HashMap;
use std::io::{Cursor, Read};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

/// Maximum sheets read from one workbook.
const MAX_SHEETS: usize = 100;
/// Maximum cells kept per sheet.
const MAX_CELLS_PER_SHEET: usize = 2_000_000;
/// Maximum dense grid size (rows x columns) built for one sheet.
const MAX_GRID_CELLS: usize = 4_000_000;
/// Last row and column a worksheet can address (`XFD1048576`).
const MAX_ROWS: usize = 1_048_576;
const MAX_COLUMNS: usize = 16_384;
/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 200 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum WorkbookError {
    #[error("not a valid xlsx archive: {0}")]
    Archive(String),
    #[error("missing workbook part: {0}")]
    MissingPart(String),
    #[error("ZIP entry {name} exceeds size limit ({limit} bytes)")]
    TooLarge { name: String, limit: u64 },
    #[error("malformed workbook xml in {part}: {reason}")]
    Xml { part: String, reason: String },
    #[error("sheet {part} spans {rows} rows x {cols} columns, over the {limit} cell limit")]
    SheetTooLarge {
        part: String,
        rows: usize,
        cols: usize,
        limit: usize,
    },
}

/// How a sheet is indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheetKind {
    /// No cells at all; skipped.
    Empty,
    /// Rendered to an image and read by the vision check.
    Small,
    /// Materialized as a relational table.
    Big,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sheet {
    pub name: String,
    /// Row-major cells; every row has `max_col` entries.
    pub rows: Vec<Vec<String>>,
}

impl Sheet {
    /// Index of the last row holding a value (1-based count).
    pub fn max_row(&self) -> usize {
        self.rows.len()
    }

    pub fn max_col(&self) -> usize {
        self.rows.first().map(|r| r.len()).unwrap_or(0)
    }

    pub fn classify(&self, small_max_rows: usize, small_max_cols: usize) -> SheetKind {
        if self.max_row() == 0 || self.max_col() == 0 {
            SheetKind::Empty
        } else if self.max_row() <= small_max_rows && self.max_col() <= small_max_cols {
            SheetKind::Small
        } else {
            SheetKind::Big
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Workbook {
    pub sheets: Vec<Sheet>,
}

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

impl Workbook {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WorkbookError> {
        let mut archive =
            zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| WorkbookError::Archive(e.to_string()))?;

        let has_shared = archive.file_names().any(|n| n == "xl/sharedStrings.xml");
        let shared = if has_shared {
            let xml = read_entry(&mut archive, "xl/sharedStrings.xml")?;
            read_shared_strings(&xml)?
        } else {
            Vec::new()
        };

        let mut sheets = Vec::new();
        for (name, part) in list_sheets(&mut archive)?.into_iter().take(MAX_SHEETS) {
            let xml = read_entry(&mut archive, &part)?;
            let rows = read_sheet_cells(&xml, &part, &shared)?;
            sheets.push(Sheet { name, rows });
        }
        Ok(Self { sheets })
    }
}

fn read_entry(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, WorkbookError> {
    let entry = archive
        .by_name(name)
        .map_err(|_| WorkbookError::MissingPart(name.to_string()))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| WorkbookError::Archive(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(WorkbookError::TooLarge {
            name: name.to_string(),
            limit: MAX_XML_ENTRY_BYTES,
        });
    }
    Ok(out)
}

fn xml_err(part: &str, e: impl std::fmt::Display) -> WorkbookError {
    WorkbookError::Xml {
        part: part.to_string(),
        reason: e.to_string(),
    }
}

/// Attribute value by local name (namespace prefixes ignored).
fn attr(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// `(sheet name, zip part path)` in workbook order.
fn list_sheets(archive: &mut Archive<'_>) -> Result<Vec<(String, String)>, WorkbookError> {
    let rels_xml = read_entry(archive, "xl/_rels/workbook.xml.rels")?;
    let mut targets: HashMap<String, String> = HashMap::new();
    let mut reader = Reader::from_reader(rels_xml.as_slice());
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"Relationship" => {
                if let (Some(id), Some(target)) = (attr(&e, b"Id"), attr(&e, b"Target")) {
                    targets.insert(id, resolve_target(&target));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_err("xl/_rels/workbook.xml.rels", e)),
            _ => {}
        }
        buf.clear();
    }

    let wb_xml = read_entry(archive, "xl/workbook.xml")?;
    let mut sheets = Vec::new();
    let mut reader = Reader::from_reader(wb_xml.as_slice());
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"sheet" => {
                let name = attr(&e, b"name").unwrap_or_default();
                if let Some(part) = attr(&e, b"id").and_then(|id| targets.get(&id).cloned()) {
                    sheets.push((name, part));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_err("xl/workbook.xml", e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(sheets)
}

fn resolve_target(target: &str) -> String {
    match target.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None => format!("xl/{}", target),
    }
}

/// Shared strings; rich-text runs within one `<si>` are concatenated.
fn read_shared_strings(xml: &[u8]) -> Result<Vec<String>, WorkbookError> {
    let part = "xl/sharedStrings.xml";
    let mut strings = Vec::new();
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    let mut in_rph = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                b"rPh" => in_rph = true,
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Ok(Event::Text(te)) if in_t && !in_rph => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&te.unescape().map_err(|e| xml_err(part, e))?);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.push(current.take().unwrap_or_default()),
                b"t" => in_t = false,
                b"rPh" => in_rph = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_err(part, e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Zero-based column index from a cell reference such as `AB12`.
/// References past column `XFD` are invalid.
fn column_index(reference: &str) -> Option<usize> {
    let letters: Vec<u8> = reference
        .bytes()
        .take_while(|b| b.is_ascii_alphabetic())
        .collect();
    if letters.is_empty() {
        return None;
    }
    let mut n = 0usize;
    for b in letters {
        let digit = (b.to_ascii_uppercase() - b'A' + 1) as usize;
        n = n.checked_mul(26)?.checked_add(digit)?;
        if n > MAX_COLUMNS {
            return None;
        }
    }
    Some(n - 1)
}

/// Zero-based row index from a 1-based row number.
fn parse_row(number: &str) -> Option<usize> {
    number
        .parse::<usize>()
        .ok()
        .filter(|r| (1..=MAX_ROWS).contains(r))
        .map(|r| r - 1)
}

fn row_index(reference: &str) -> Option<usize> {
    parse_row(reference.trim_start_matches(|c: char| c.is_ascii_alphabetic()))
}

#[derive(Default)]
struct CellState {
    row: usize,
    col: usize,
    kind: String,
    value: String,
    in_value: bool,
}

fn read_sheet_cells(
    xml: &[u8],
    part: &str,
    shared: &[String],
) -> Result<Vec<Vec<String>>, WorkbookError> {
    let mut cells: Vec<(usize, usize, String)> = Vec::new();
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut row = 0usize;
    let mut next_col = 0usize;
    let mut cell: Option<CellState> = None;

    loop {
        if cells.len() >= MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => {
                    row = attr(&e, b"r").and_then(|r| parse_row(&r)).unwrap_or(row);
                    next_col = 0;
                }
                b"c" => {
                    let reference = attr(&e, b"r").unwrap_or_default();
                    let col = column_index(&reference).unwrap_or(next_col);
                    cell = Some(CellState {
                        row: row_index(&reference).unwrap_or(row),
                        col,
                        kind: attr(&e, b"t").unwrap_or_default(),
                        ..Default::default()
                    });
                    next_col = col + 1;
                }
                b"v" | b"t" => {
                    if let Some(c) = cell.as_mut() {
                        c.in_value = true;
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"c" => {
                let reference = attr(&e, b"r").unwrap_or_default();
                next_col = column_index(&reference).unwrap_or(next_col) + 1;
            }
            Ok(Event::Text(te)) => {
                if let Some(c) = cell.as_mut().filter(|c| c.in_value) {
                    c.value.push_str(&te.unescape().map_err(|e| xml_err(part, e))?);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => {
                    if let Some(c) = cell.as_mut() {
                        c.in_value = false;
                    }
                }
                b"c" => {
                    if let Some(c) = cell.take() {
                        let text = cell_text(&c.kind, &c.value, shared);
                        if !text.is_empty() {
                            cells.push((c.row, c.col, text));
                        }
                    }
                }
                b"row" => row = (row + 1).min(MAX_ROWS - 1),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_err(part, e)),
            _ => {}
        }
        buf.clear();
    }

    let height = cells.iter().map(|(r, _, _)| r + 1).max().unwrap_or(0);
    let width = cells.iter().map(|(_, c, _)| c + 1).max().unwrap_or(0);
    if height.saturating_mul(width) > MAX_GRID_CELLS {
        return Err(WorkbookError::SheetTooLarge {
            part: part.to_string(),
            rows: height,
            cols: width,
            limit: MAX_GRID_CELLS,
        });
    }
    let mut grid = vec![vec![String::new(); width]; height];
    for (r, c, text) in cells {
        grid[r][c] = text;
    }
    Ok(grid)
}

fn cell_text(kind: &str, raw: &str, shared: &[String]) -> String {
    match kind {
        "s" => raw
            .trim()
            .parse::<usize>()
            .ok()
            .and_then(|i| shared.get(i).cloned())
            .unwrap_or_default(),
        "b" => match raw.trim() {
            "1" => "TRUE".to_string(),
            _ => "FALSE".to_string(),
        },
        "inlineStr" | "str" => raw.to_string(),
        _ => raw.trim().to_string(),
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{rows, xlsx};
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    #[test]
    fn reads_sheets_in_workbook_order() {
        let bytes = xlsx(&[
            ("Summary", rows(&[&["Year", "Won"], &["2016", "3"]])),
            ("Tenders", rows(&[&["Title"], &["Lulu at Palm Mall"]])),
        ]);
        let wb = Workbook::from_bytes(&bytes).unwrap();
        let names: Vec<_> = wb.sheets.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Summary", "Tenders"]);
        assert_eq!(wb.sheets[1].rows[1][0], "Lulu at Palm Mall");
        assert_eq!(wb.sheets[0].rows[1], vec!["2016", "3"]);
    }

    #[test]
    fn gaps_are_kept_as_empty_cells() {
        let bytes = xlsx(&[("S", rows(&[&["a", "", "c"], &[], &["", "e"]]))]);
        let wb = Workbook::from_bytes(&bytes).unwrap();
        let s = &wb.sheets[0];
        assert_eq!(s.max_row(), 3);
        assert_eq!(s.max_col(), 3);
        assert_eq!(s.rows[0], vec!["a", "", "c"]);
        assert_eq!(s.rows[1], vec!["", "", ""]);
        assert_eq!(s.rows[2], vec!["", "e", ""]);
    }

    #[test]
    fn classifies_by_dimensions() {
        let small = Sheet {
            name: "s".into(),
            rows: vec![vec!["x".into(); 10]; 40],
        };
        assert_eq!(small.classify(40, 10), SheetKind::Small);
        let wide = Sheet {
            name: "w".into(),
            rows: vec![vec!["x".into(); 11]; 2],
        };
        assert_eq!(wide.classify(40, 10), SheetKind::Big);
        let long = Sheet {
            name: "l".into(),
            rows: vec![vec!["x".into(); 2]; 41],
        };
        assert_eq!(long.classify(40, 10), SheetKind::Big);
        let empty = Sheet {
            name: "e".into(),
            rows: Vec::new(),
        };
        assert_eq!(empty.classify(40, 10), SheetKind::Empty);
    }

    #[test]
    fn shared_strings_and_booleans() {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let opts = SimpleFileOptions::default();
        zip.start_file("xl/workbook.xml", opts).unwrap();
        zip.write_all(
            br#"<workbook xmlns:r="r"><sheets><sheet name="Data" sheetId="1" r:id="rId7"/></sheets></workbook>"#,
        )
        .unwrap();
        zip.start_file("xl/_rels/workbook.xml.rels", opts).unwrap();
        zip.write_all(
            br#"<Relationships><Relationship Id="rId7" Target="/xl/worksheets/data.xml"/></Relationships>"#,
        )
        .unwrap();
        zip.start_file("xl/sharedStrings.xml", opts).unwrap();
        zip.write_all(
            br#"<sst><si><t>Plain</t></si><si><r><t>Rich </t></r><r><t>text</t></r></si></sst>"#,
        )
        .unwrap();
        zip.start_file("xl/worksheets/data.xml", opts).unwrap();
        zip.write_all(
            br#"<worksheet><sheetData><row r="1"><c r="A1" t="s"><v>1</v></c><c r="B1" t="b"><v>1</v></c><c r="C1" t="s"><v>0</v></c></row></sheetData></worksheet>"#,
        )
        .unwrap();
        let bytes = zip.finish().unwrap().into_inner();

        let wb = Workbook::from_bytes(&bytes).unwrap();
        assert_eq!(wb.sheets[0].name, "Data");
        assert_eq!(wb.sheets[0].rows[0], vec!["Rich text", "TRUE", "Plain"]);
    }

    #[test]
    fn not_a_zip_is_archive_error() {
        let err = Workbook::from_bytes(b"not a zip").unwrap_err();
        assert!(matches!(err, WorkbookError::Archive(_)));
    }

    #[test]
    fn column_letters() {
        assert_eq!(column_index("A1"), Some(0));
        assert_eq!(column_index("Z9"), Some(25));
        assert_eq!(column_index("AA3"), Some(26));
        assert_eq!(row_index("C12"), Some(11));
        assert_eq!(column_index("XFD1"), Some(MAX_COLUMNS - 1));
        assert_eq!(column_index("XFE1"), None);
        assert_eq!(column_index("AAAAAAAAAAAAAAAA1"), None);
        assert_eq!(row_index("A0"), None);
        assert_eq!(row_index("A1048577"), None);
    }

    #[test]
    fn over_long_column_reference_falls_back_to_position() {
        let xml = br#"<worksheet><sheetData><row r="1"><c r="A1" t="inlineStr"><is><t>Title</t></is></c><c r="AAAAAAAAAAAAAAAA1"><v>7</v></c></row></sheetData></worksheet>"#;
        let grid = read_sheet_cells(xml, "xl/worksheets/sheet1.xml", &[]).unwrap();
        assert_eq!(grid, vec![vec!["Title".to_string(), "7".to_string()]]);
    }

    #[test]
    fn far_away_cell_is_rejected_before_building_the_grid() {
        let xml = br#"<worksheet><sheetData><row r="1"><c r="A1" t="inlineStr"><is><t>Title</t></is></c></row><row r="1048576"><c r="XFD1048576"><v>1</v></c></row></sheetData></worksheet>"#;
        let err = read_sheet_cells(xml, "xl/worksheets/sheet1.xml", &[]).unwrap_err();
        match err {
            WorkbookError::SheetTooLarge { rows, cols, .. } => {
                assert_eq!(rows, MAX_ROWS);
                assert_eq!(cols, MAX_COLUMNS);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn far_away_cell_fails_the_whole_workbook() {
        let mut far = vec![vec![String::new(); 3]; 5000];
        far[0][0] = "Title".into();
        far[4999][2] = "1".into();
        let ok = Workbook::from_bytes(&xlsx(&[("Near", far)])).unwrap();
        assert_eq!(ok.sheets[0].max_row(), 5000);

        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let opts = SimpleFileOptions::default();
        zip.start_file("xl/workbook.xml", opts).unwrap();
        zip.write_all(br#"<workbook xmlns:r="r"><sheets><sheet name="Far" sheetId="1" r:id="rId1"/></sheets></workbook>"#)
            .unwrap();
        zip.start_file("xl/_rels/workbook.xml.rels", opts).unwrap();
        zip.write_all(br#"<Relationships><Relationship Id="rId1" Target="worksheets/sheet1.xml"/></Relationships>"#)
            .unwrap();
        zip.start_file("xl/worksheets/sheet1.xml", opts).unwrap();
        zip.write_all(br#"<worksheet><sheetData><row r="1"><c r="A1"><v>1</v></c><c r="XFD1048576"><v>2</v></c></row></sheetData></worksheet>"#)
            .unwrap();
        let bytes = zip.finish().unwrap().into_inner();
        assert!(matches!(
            Workbook::from_bytes(&bytes),
            Err(WorkbookError::SheetTooLarge { .. })
        ));
    }
}
