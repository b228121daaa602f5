//! ZIP archive plumbing shared by the two template renderers.
//!
//! Templates are never mutated in place: an `Archive` loads every entry into
//! memory, parts are rewritten there, and the output file is written only
//! after all replacements succeeded.

use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{Error, Result};

const RELATIONSHIPS_NS: &str = "http://schemas.openxmlformats.org/package/2006/relationships";

static REL_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"Id="rId(\d+)""#).unwrap());
static W_T_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<w:t(?:>|\s[^>]*[^/]>)(.*?)</w:t>").unwrap());

/// An OOXML package held fully in memory, entry order preserved.
pub struct Archive {
    entries: Vec<(String, Vec<u8>)>,
}

impl Archive {
    /// Opens `path` read-only. Fails with `NotFound` when the path does not
    /// exist and with `Format` when it is not a readable ZIP archive.
    pub fn read(path: &Path, kind: &'static str) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotFound(path.to_path_buf()));
        }
        let file = std::fs::File::open(path)?;
        let mut zip = ZipArchive::new(BufReader::new(file)).map_err(|e| Error::Format {
            path: path.to_path_buf(),
            kind,
            message: e.to_string(),
        })?;
        let mut entries = Vec::with_capacity(zip.len());
        for index in 0..zip.len() {
            let mut entry = zip.by_index(index).map_err(|e| Error::Format {
                path: path.to_path_buf(),
                kind,
                message: e.to_string(),
            })?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut bytes)?;
            entries.push((name, bytes));
        }
        Ok(Self { entries })
    }

    pub fn part_names(&self) -> Vec<String> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, bytes)| bytes.as_slice())
    }

    pub fn get_str(&self, name: &str) -> Option<String> {
        self.get(name)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// Replaces an existing part or appends a new one.
    pub fn set(&mut self, name: &str, bytes: Vec<u8>) {
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| n == name) {
            entry.1 = bytes;
        } else {
            self.entries.push((name.to_string(), bytes));
        }
    }

    /// Writes the package to `path`, creating parent directories as needed.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::File::create(path)?;
        let mut zip = ZipWriter::new(BufWriter::new(file));
        let options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        for (name, bytes) in &self.entries {
            zip.start_file(name.clone(), options)?;
            zip.write_all(bytes)?;
        }
        zip.finish()?;
        Ok(())
    }
}

pub fn xml_escape(text: &str) -> String {
    quick_xml::escape::escape(text).into_owned()
}

pub fn xml_unescape(text: &str) -> String {
    quick_xml::escape::unescape(text)
        .map(|cow| cow.into_owned())
        .unwrap_or_else(|_| text.to_string())
}

/// True for the text-bearing parts of a flow document: the body plus every
/// header and footer section.
pub fn is_document_text_part(name: &str) -> bool {
    if name == "word/document.xml" {
        return true;
    }
    name.starts_with("word/header") && name.ends_with(".xml")
        || name.starts_with("word/footer") && name.ends_with(".xml")
}

/// Unescaped `<w:t>` text spans of a flow-document part, in document order.
pub fn run_texts(xml: &str) -> Vec<String> {
    W_T_RE
        .captures_iter(xml)
        .map(|cap| xml_unescape(cap.get(1).unwrap().as_str()))
        .collect()
}

/// The `.rels` part name for a given package part.
pub fn rels_name_for(part: &str) -> String {
    match part.rfind('/') {
        Some(index) => format!("{}/_rels/{}.rels", &part[..index], &part[index + 1..]),
        None => format!("_rels/{}.rels", part),
    }
}

/// Splices `fragment` just before the root element's closing tag. A
/// self-closed root (`<Root .../>`) is expanded first. `None` when the root
/// element cannot be found at all.
fn insert_before_root_close(xml: &str, root: &str, fragment: &str) -> Option<String> {
    let close = format!("</{}>", root);
    if xml.contains(&close) {
        return Some(xml.replacen(&close, &format!("{}{}", fragment, close), 1));
    }
    let trimmed = xml.trim_end();
    if trimmed.ends_with("/>") && trimmed.contains(&format!("<{}", root)) {
        return Some(format!(
            "{}>{}{}",
            &trimmed[..trimmed.len() - 2],
            fragment,
            close
        ));
    }
    None
}

/// Appends a relationship to a part's `.rels` (created when absent) and
/// returns the allocated `rId`.
pub fn add_relationship(
    archive: &mut Archive,
    rels_name: &str,
    rel_type: &str,
    target: &str,
) -> String {
    let xml = archive.get_str(rels_name).unwrap_or_else(|| {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\
             <Relationships xmlns=\"{}\"></Relationships>",
            RELATIONSHIPS_NS
        )
    });
    let next = REL_ID_RE
        .captures_iter(&xml)
        .filter_map(|cap| cap.get(1).unwrap().as_str().parse::<u32>().ok())
        .max()
        .unwrap_or(0)
        + 1;
    let rel_id = format!("rId{}", next);
    let relationship = format!(
        "<Relationship Id=\"{}\" Type=\"{}\" Target=\"{}\"/>",
        rel_id, rel_type, target
    );
    match insert_before_root_close(&xml, "Relationships", &relationship) {
        Some(updated) => archive.set(rels_name, updated.into_bytes()),
        None => warn!(
            "{}: no Relationships root, cannot wire {}",
            rels_name, target
        ),
    }
    rel_id
}

/// Ensures `[Content_Types].xml` declares a default content type for `ext`.
pub fn ensure_default_content_type(archive: &mut Archive, ext: &str, content_type: &str) {
    let Some(xml) = archive.get_str("[Content_Types].xml") else {
        warn!("package has no [Content_Types].xml, cannot declare .{}", ext);
        return;
    };
    if xml.contains(&format!("Extension=\"{}\"", ext)) {
        return;
    }
    let default = format!(
        "<Default Extension=\"{}\" ContentType=\"{}\"/>",
        ext, content_type
    );
    match insert_before_root_close(&xml, "Types", &default) {
        Some(updated) => archive.set("[Content_Types].xml", updated.into_bytes()),
        None => warn!("[Content_Types].xml: no Types root, cannot declare .{}", ext),
    }
}

/// Declares the content type of a newly created package part.
pub fn add_content_type_override(archive: &mut Archive, part: &str, content_type: &str) {
    let Some(xml) = archive.get_str("[Content_Types].xml") else {
        warn!("package has no [Content_Types].xml, cannot declare {}", part);
        return;
    };
    let part_name = format!("/{}", part);
    if xml.contains(&format!("PartName=\"{}\"", part_name)) {
        return;
    }
    let entry = format!(
        "<Override PartName=\"{}\" ContentType=\"{}\"/>",
        part_name, content_type
    );
    match insert_before_root_close(&xml, "Types", &entry) {
        Some(updated) => archive.set("[Content_Types].xml", updated.into_bytes()),
        None => warn!("[Content_Types].xml: no Types root, cannot declare {}", part),
    }
}

/// Smallest free `imageN` index under a media directory such as `xl/media/`.
pub fn next_media_index(archive: &Archive, media_dir: &str) -> u32 {
    let mut index = 1;
    while archive.contains(&format!("{}image{}.png", media_dir, index)) {
        index += 1;
    }
    index
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Builders for the smallest `.xlsx`/`.docx` packages the readers and
    //! renderers accept, used as template fixtures across the test modules.

    use super::*;

    const XLSX_CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/>{overrides}</Types>"#;

    const ROOT_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="{target}"/></Relationships>"#;

    pub fn write_minimal_xlsx(path: &Path, sheets: &[(&str, Vec<Vec<&str>>)]) {
        let mut archive = Archive { entries: Vec::new() };

        let mut overrides = String::new();
        let mut workbook_sheets = String::new();
        let mut workbook_rels = String::new();
        for (index, (name, _)) in sheets.iter().enumerate() {
            let n = index + 1;
            overrides.push_str(&format!(
                "<Override PartName=\"/xl/worksheets/sheet{}.xml\" ContentType=\"application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml\"/>",
                n
            ));
            workbook_sheets.push_str(&format!(
                "<sheet name=\"{}\" sheetId=\"{}\" r:id=\"rId{}\"/>",
                xml_escape(name),
                n,
                n
            ));
            workbook_rels.push_str(&format!(
                "<Relationship Id=\"rId{}\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet\" Target=\"worksheets/sheet{}.xml\"/>",
                n, n
            ));
        }

        archive.set(
            "[Content_Types].xml",
            XLSX_CONTENT_TYPES
                .replace("{overrides}", &overrides)
                .into_bytes(),
        );
        archive.set(
            "_rels/.rels",
            ROOT_RELS.replace("{target}", "xl/workbook.xml").into_bytes(),
        );
        archive.set(
            "xl/workbook.xml",
            format!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets>{}</sheets></workbook>"#,
                workbook_sheets
            )
            .into_bytes(),
        );
        archive.set(
            "xl/_rels/workbook.xml.rels",
            format!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="{}">{}</Relationships>"#,
                RELATIONSHIPS_NS, workbook_rels
            )
            .into_bytes(),
        );

        for (index, (_, rows)) in sheets.iter().enumerate() {
            let mut sheet_data = String::new();
            for (r, row) in rows.iter().enumerate() {
                sheet_data.push_str(&format!("<row r=\"{}\">", r + 1));
                for (c, value) in row.iter().enumerate() {
                    sheet_data.push_str(&format!(
                        "<c r=\"{}\" t=\"inlineStr\"><is><t xml:space=\"preserve\">{}</t></is></c>",
                        cell_ref(r as u32, c as u32),
                        xml_escape(value)
                    ));
                }
                sheet_data.push_str("</row>");
            }
            archive.set(
                &format!("xl/worksheets/sheet{}.xml", index + 1),
                format!(
                    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>{}</sheetData></worksheet>"#,
                    sheet_data
                )
                .into_bytes(),
            );
        }

        archive.write(path).unwrap();
    }

    pub fn cell_ref(row: u32, col: u32) -> String {
        let mut letters = String::new();
        let mut remaining = col + 1;
        while remaining > 0 {
            let digit = (remaining - 1) % 26;
            letters.insert(0, (b'A' + digit as u8) as char);
            remaining = (remaining - 1) / 26;
        }
        format!("{}{}", letters, row + 1)
    }

    pub fn write_minimal_docx(
        path: &Path,
        body_runs: &[&str],
        header: Option<&str>,
        footer: Option<&str>,
    ) {
        let mut archive = Archive { entries: Vec::new() };

        let mut overrides = String::from(
            "<Override PartName=\"/word/document.xml\" ContentType=\"application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml\"/>",
        );
        if header.is_some() {
            overrides.push_str("<Override PartName=\"/word/header1.xml\" ContentType=\"application/vnd.openxmlformats-officedocument.wordprocessingml.header+xml\"/>");
        }
        if footer.is_some() {
            overrides.push_str("<Override PartName=\"/word/footer1.xml\" ContentType=\"application/vnd.openxmlformats-officedocument.wordprocessingml.footer+xml\"/>");
        }

        archive.set(
            "[Content_Types].xml",
            format!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/>{}</Types>"#,
                overrides
            )
            .into_bytes(),
        );
        archive.set(
            "_rels/.rels",
            ROOT_RELS
                .replace("{target}", "word/document.xml")
                .into_bytes(),
        );

        let paragraphs: String = body_runs
            .iter()
            .map(|text| paragraph_xml(text))
            .collect();
        archive.set(
            "word/document.xml",
            format!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{}</w:body></w:document>"#,
                paragraphs
            )
            .into_bytes(),
        );

        if let Some(text) = header {
            archive.set(
                "word/header1.xml",
                format!(
                    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:hdr xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">{}</w:hdr>"#,
                    paragraph_xml(text)
                )
                .into_bytes(),
            );
        }
        if let Some(text) = footer {
            archive.set(
                "word/footer1.xml",
                format!(
                    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:ftr xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">{}</w:ftr>"#,
                    paragraph_xml(text)
                )
                .into_bytes(),
            );
        }

        archive.write(path).unwrap();
    }

    pub fn paragraph_xml(text: &str) -> String {
        format!(
            "<w:p><w:r><w:t xml:space=\"preserve\">{}</w:t></w:r></w:p>",
            xml_escape(text)
        )
    }
}
