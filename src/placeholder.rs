use calamine::{open_workbook_auto, Reader};
use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;

use crate::error::{Error, Result};
use crate::ooxml::{self, Archive};

/// Matches one `{name}` span; braces must not nest.
pub static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{([^{}]+)\}").unwrap());

/// Matches a value that is exactly one image token, `{name.img}`.
static IMAGE_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\{([^{}]+)\.img\}$").unwrap());

/// Returns the image binding name when `text` as a whole is an image token.
/// A token embedded in surrounding text is not an image token.
pub fn image_token_name(text: &str) -> Option<&str> {
    IMAGE_TOKEN_RE
        .captures(text)
        .map(|cap| cap.get(1).unwrap().as_str())
}

/// Distinct token names in discovery order.
#[derive(Debug, Default)]
pub struct TokenSet {
    names: Vec<String>,
    seen: HashSet<String>,
}

impl TokenSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_from_text(&mut self, text: &str) {
        for cap in TOKEN_RE.captures_iter(text) {
            let name = cap.get(1).unwrap().as_str();
            if self.seen.insert(name.to_string()) {
                self.names.push(name.to_string());
            }
        }
    }

    pub fn into_names(self) -> Vec<String> {
        self.names
    }
}

/// Distinct `{...}` token names found in `text`, in discovery order.
pub fn scan_text(text: &str) -> Vec<String> {
    let mut tokens = TokenSet::new();
    tokens.add_from_text(text);
    tokens.into_names()
}

/// Scans every cell of every sheet of a spreadsheet template. Unreadable
/// sheets are skipped; the scan returns whatever was collected.
pub fn scan_workbook(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Err(Error::NotFound(path.to_path_buf()));
    }
    let mut workbook = open_workbook_auto(path).map_err(|e| Error::Format {
        path: path.to_path_buf(),
        kind: "spreadsheet",
        message: e.to_string(),
    })?;
    let mut tokens = TokenSet::new();
    for name in workbook.sheet_names() {
        let range = match workbook.worksheet_range(&name) {
            Ok(range) => range,
            Err(e) => {
                warn!("skipping unreadable sheet '{}': {}", name, e);
                continue;
            }
        };
        for row in range.rows() {
            for cell in row {
                tokens.add_from_text(&cell.to_string());
            }
        }
    }
    Ok(tokens.into_names())
}

/// Scans run text across the body, headers and footers of a flow-document
/// template. Unreadable parts are skipped per-item.
pub fn scan_document(path: &Path) -> Result<Vec<String>> {
    let archive = Archive::read(path, "flow")?;
    let mut tokens = TokenSet::new();
    for name in archive.part_names() {
        if !ooxml::is_document_text_part(&name) {
            continue;
        }
        let Some(bytes) = archive.get(&name) else { continue };
        match std::str::from_utf8(bytes) {
            Ok(xml) => {
                for text in ooxml::run_texts(xml) {
                    tokens.add_from_text(&text);
                }
            }
            Err(e) => warn!("skipping non-UTF-8 part '{}': {}", name, e),
        }
    }
    Ok(tokens.into_names())
}
