//! Loading and persisting customer datasets.
//!
//! Inputs may be spreadsheets (`.xlsx`, `.xls`, `.ods`, read with calamine)
//! or delimited text (`.csv`). The enriched dataset is always written as an
//! `.xlsx` workbook.

use crate::errors::{AppError, ResultExt};
use crate::models::{CellValue, Dataset, COLUMN_LATITUDE, COLUMN_LONGITUDE};
use calamine::{open_workbook_auto, Data, Reader};
use rust_xlsxwriter::Workbook;
use std::fs;
use std::path::{Path, PathBuf};

/// Returns the first candidate that exists, in order.
pub fn discover_input(dir: &Path, candidates: &[PathBuf]) -> Result<PathBuf, AppError> {
    for candidate in candidates {
        let path = if candidate.is_absolute() {
            candidate.clone()
        } else {
            dir.join(candidate)
        };
        if path.is_file() {
            tracing::info!("Using input file {}", path.display());
            return Ok(path);
        }
    }

    let names: Vec<String> = candidates
        .iter()
        .map(|c| format!("'{}'", c.display()))
        .collect();
    Err(AppError::InputMissing(format!(
        "none of {} found in {}",
        names.join(", "),
        dir.display()
    )))
}

/// Loads a dataset, choosing the reader from the file extension.
pub fn load_dataset(path: &Path) -> Result<Dataset, AppError> {
    if !path.is_file() {
        return Err(AppError::InputMissing(format!(
            "{} does not exist",
            path.display()
        )));
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let (header, rows) = match extension.as_str() {
        "csv" | "txt" => read_csv(path)?,
        "xlsx" | "xlsm" | "xls" | "xlsb" | "ods" => read_workbook(path)?,
        other => {
            return Err(AppError::InputFormat(format!(
                "Unsupported file extension '{}' for {}",
                other,
                path.display()
            )))
        }
    };

    let dataset = Dataset::from_rows(header, rows)
        .with_context(|| format!("Loading {}", path.display()))?;

    tracing::info!(
        "Loaded {} record(s) from {} ({} already geocoded)",
        dataset.len(),
        path.display(),
        dataset.geocoded_count()
    );
    Ok(dataset)
}

type RawTable = (Vec<String>, Vec<Vec<CellValue>>);

fn read_workbook(path: &Path) -> Result<RawTable, AppError> {
    let mut workbook = open_workbook_auto(path).map_err(|e| {
        AppError::InputFormat(format!("Failed to open {}: {}", path.display(), e))
    })?;

    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| AppError::InputFormat(format!("{} contains no sheets", path.display())))?;

    let range = workbook.worksheet_range(&sheet_name).map_err(|e| {
        AppError::InputFormat(format!("Failed to read sheet '{}': {}", sheet_name, e))
    })?;

    let mut rows = range.rows();
    let header = rows
        .next()
        .map(|cells| cells.iter().map(|c| c.to_string().trim().to_string()).collect())
        .ok_or_else(|| AppError::InputFormat(format!("Sheet '{}' is empty", sheet_name)))?;

    let body = rows
        .map(|cells| cells.iter().map(cell_from_calamine).collect())
        .collect();

    Ok((header, body))
}

fn cell_from_calamine(cell: &Data) -> CellValue {
    match cell {
        Data::Int(i) => CellValue::Number(*i as f64),
        Data::Float(f) => CellValue::Number(*f),
        Data::String(s) if s.trim().is_empty() => CellValue::Empty,
        Data::String(s) => CellValue::Text(s.trim().to_string()),
        Data::Bool(b) => CellValue::Bool(*b),
        Data::DateTime(dt) => CellValue::Number(dt.as_f64()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => CellValue::Text(s.clone()),
        Data::Error(_) | Data::Empty => CellValue::Empty,
    }
}

fn read_csv(path: &Path) -> Result<RawTable, AppError> {
    let content = read_file_as_utf8(path)?;
    let delimiter = sniff_delimiter(&content);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(content.as_bytes());

    let header = reader
        .headers()
        .map_err(|e| AppError::InputFormat(format!("Invalid CSV header: {}", e)))?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for (line, result) in reader.records().enumerate() {
        let record = result.map_err(|e| {
            AppError::InputFormat(format!("Invalid CSV record {}: {}", line + 1, e))
        })?;
        rows.push(record.iter().map(CellValue::parse).collect());
    }

    Ok((header, rows))
}

/// Picks the delimiter giving the most consistent field count over the first lines.
fn sniff_delimiter(content: &str) -> u8 {
    let candidates: &[u8] = &[b',', b';', b'\t', b'|'];
    let sample_lines: Vec<&str> = content.lines().take(10).collect();

    let mut best = b',';
    let mut best_score = 0usize;

    for &delim in candidates {
        let counts: Vec<usize> = sample_lines
            .iter()
            .map(|line| {
                csv::ReaderBuilder::new()
                    .delimiter(delim)
                    .has_headers(false)
                    .flexible(true)
                    .from_reader(line.as_bytes())
                    .records()
                    .next()
                    .and_then(|r| r.ok())
                    .map(|r| r.len())
                    .unwrap_or(1)
            })
            .collect();

        let target = counts.first().copied().unwrap_or(0);
        if target <= 1 {
            continue;
        }

        let consistent = counts.iter().filter(|&&c| c == target).count();
        let score = consistent * target;
        if score > best_score {
            best_score = score;
            best = delim;
        }
    }

    best
}

/// Reads a text file, falling back to Windows-1252 for spreadsheet exports
/// that are not valid UTF-8.
fn read_file_as_utf8(path: &Path) -> Result<String, AppError> {
    let bytes = fs::read(path).with_context(|| format!("Reading {}", path.display()))?;
    match String::from_utf8(bytes) {
        Ok(s) => Ok(s),
        Err(e) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(e.as_bytes());
            Ok(decoded.into_owned())
        }
    }
}

/// Writes the dataset as an `.xlsx` workbook, replacing any previous file.
///
/// The workbook is saved next to the target and renamed over it, so a failed
/// write never leaves a truncated enrichment file behind.
pub fn persist_dataset(dataset: &Dataset, path: &Path) -> Result<(), AppError> {
    let persist_err =
        |what: &str, e: &dyn std::fmt::Display| AppError::Persistence(format!("{}: {}", what, e));

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| persist_err("Failed to create directory", &e))?;
    }

    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet
        .set_name("clientes")
        .map_err(|e| persist_err("Failed to name sheet", &e))?;

    let mut header: Vec<&str> = dataset.columns().iter().map(String::as_str).collect();
    header.push(COLUMN_LATITUDE);
    header.push(COLUMN_LONGITUDE);
    for (col, name) in header.iter().enumerate() {
        worksheet
            .write_string(0, col as u16, *name)
            .map_err(|e| persist_err("Failed to write header", &e))?;
    }

    let coordinate_col = dataset.columns().len() as u16;
    for (idx, record) in dataset.records().iter().enumerate() {
        let row = (idx + 1) as u32;
        for (col, cell) in record.cells.iter().enumerate() {
            let col = col as u16;
            let written = match cell {
                CellValue::Text(s) => worksheet.write_string(row, col, s.as_str()).map(|_| ()),
                CellValue::Number(n) if n.is_finite() => {
                    worksheet.write_number(row, col, *n).map(|_| ())
                }
                CellValue::Bool(b) => worksheet.write_boolean(row, col, *b).map(|_| ()),
                CellValue::Number(_) | CellValue::Empty => Ok(()),
            };
            written.map_err(|e| persist_err("Failed to write cell", &e))?;
        }

        if let Some(coordinate) = record.coordinate {
            worksheet
                .write_number(row, coordinate_col, coordinate.latitude)
                .map_err(|e| persist_err("Failed to write latitude", &e))?;
            worksheet
                .write_number(row, coordinate_col + 1, coordinate.longitude)
                .map_err(|e| persist_err("Failed to write longitude", &e))?;
        }
    }

    let tmp_path = temp_path_for(path);
    if let Err(e) = workbook.save(&tmp_path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(persist_err(
            &format!("Failed to save {}", path.display()),
            &e,
        ));
    }
    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(persist_err(
            &format!("Failed to replace {}", path.display()),
            &e,
        ));
    }

    tracing::info!(
        "✓ Persisted {} record(s) to {}",
        dataset.len(),
        path.display()
    );
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dataset.xlsx".to_string());
    path.with_file_name(format!(".{}.tmp", name))
}
