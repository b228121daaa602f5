use calamine::{open_workbook_auto, Data, Range, Reader};
use log::info;
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};

/// One worksheet's data: ordered headers plus one string map per retained row.
///
/// A row is retained only when at least one of its cells is non-empty; every
/// row's key set is a subset of `headers`.
#[derive(Debug, Clone, Default)]
pub struct TabularDataset {
    pub headers: Vec<String>,
    pub rows: Vec<HashMap<String, String>>,
    pub source_label: String,
}

impl TabularDataset {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Reads the first worksheet of a workbook.
pub fn read_first_sheet(path: &Path) -> Result<TabularDataset> {
    let mut workbook = open_workbook(path)?;
    let names = workbook.sheet_names();
    let first = names
        .first()
        .cloned()
        .ok_or_else(|| Error::Format {
            path: path.to_path_buf(),
            kind: "spreadsheet",
            message: "workbook contains no worksheets".to_string(),
        })?;
    let range = workbook.worksheet_range(&first).map_err(|e| Error::Format {
        path: path.to_path_buf(),
        kind: "spreadsheet",
        message: e.to_string(),
    })?;
    let mut dataset = parse_range(&range);
    dataset.source_label = file_label(path);
    info!("loaded {:?}: {} rows", path, dataset.row_count());
    Ok(dataset)
}

/// Reads every non-empty worksheet of a workbook. A sheet qualifies only when
/// it yields at least one header and one retained row; its source label is
/// qualified with the sheet name.
pub fn read_all_sheets(path: &Path) -> Result<Vec<TabularDataset>> {
    let mut workbook = open_workbook(path)?;
    let mut datasets = Vec::new();
    for name in workbook.sheet_names() {
        let range = match workbook.worksheet_range(&name) {
            Ok(range) => range,
            Err(e) => {
                log::warn!("skipping sheet '{}' of {:?}: {}", name, path, e);
                continue;
            }
        };
        let mut dataset = parse_range(&range);
        if dataset.headers.is_empty() || dataset.rows.is_empty() {
            continue;
        }
        dataset.source_label = format!("{} - {}", file_label(path), name);
        datasets.push(dataset);
    }
    info!("loaded {:?}: {} non-empty sheets", path, datasets.len());
    Ok(datasets)
}

fn open_workbook(path: &Path) -> Result<calamine::Sheets<std::io::BufReader<std::fs::File>>> {
    if !path.exists() {
        return Err(Error::NotFound(path.to_path_buf()));
    }
    open_workbook_auto(path).map_err(|e| Error::Format {
        path: path.to_path_buf(),
        kind: "spreadsheet",
        message: e.to_string(),
    })
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Header row is always sheet row 0; columns with an empty trimmed header are
/// skipped and excluded from every row record.
fn parse_range(range: &Range<Data>) -> TabularDataset {
    let mut dataset = TabularDataset::default();
    let mut rows = range.rows();

    let Some(header_row) = rows.next() else {
        return dataset;
    };
    // (column index, header) pairs; gaps from blank headers stay gaps
    let mut columns: Vec<(usize, String)> = Vec::new();
    for (index, cell) in header_row.iter().enumerate() {
        let header = cell_to_string(cell);
        if !header.is_empty() {
            dataset.headers.push(header.clone());
            columns.push((index, header));
        }
    }

    for row in rows {
        let mut record = HashMap::new();
        let mut has_data = false;
        for (index, header) in &columns {
            let value = row.get(*index).map(cell_to_string).unwrap_or_default();
            if !value.is_empty() {
                has_data = true;
            }
            record.insert(header.clone(), value);
        }
        if has_data {
            dataset.rows.push(record);
        }
    }
    dataset
}

/// Renders a cell as a trimmed string; integral floats lose the trailing `.0`.
fn cell_to_string(data: &Data) -> String {
    match data {
        Data::String(value) => value.trim().to_string(),
        Data::Float(value) => {
            if value.fract() == 0.0 && value.abs() < 1e15 {
                format!("{}", *value as i64)
            } else {
                value.to_string()
            }
        }
        Data::Int(value) => value.to_string(),
        Data::Bool(value) => value.to_string(),
        Data::DateTime(value) => value.to_string().trim().to_string(),
        Data::DateTimeIso(value) | Data::DurationIso(value) => value.trim().to_string(),
        Data::Error(_) | Data::Empty => String::new(),
    }
}
