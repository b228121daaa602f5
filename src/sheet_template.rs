//! Spreadsheet template renderer.
//!
//! The template is loaded whole, every string cell of every sheet gets its
//! `{field}` tokens replaced, and cells whose full value is an image token are
//! cleared and anchored with a picture. All edits happen in memory; the output
//! file is only written once every replacement succeeded, so a failed render
//! never leaves a half-written file behind.

use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::images;
use crate::ooxml::{self, Archive};
use crate::placeholder;

const DRAWING_REL_TYPE: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/drawing";
const IMAGE_REL_TYPE: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/image";
const DRAWING_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.drawing+xml";

const EMU_PER_PIXEL: i64 = 9525;
// nominal single-cell anchor box (default column width x row height)
const CELL_BOX_WIDTH_PX: f64 = 64.0;
const CELL_BOX_HEIGHT_PX: f64 = 20.0;

static CELL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<c\b[^>]*/>|<c\b[^>]*>.*?</c>").unwrap());
static CELL_OPEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)^<c\b([^>]*?)/?>").unwrap());
static CELL_TYPE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\st="([^"]*)""#).unwrap());
static CELL_REF_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\sr="([A-Z]+)(\d+)""#).unwrap());
static VALUE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<v>(.*?)</v>").unwrap());
static SI_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<si(?:\s[^>]*)?>(.*?)</si>").unwrap());
static TEXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<t(?:>|\s[^>]*[^/]>)(.*?)</t>").unwrap());
static DRAWING_REF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<drawing r:id="([^"]+)"\s*/>"#).unwrap());

/// How an inserted picture is scaled against its anchor cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFillMode {
    /// Preserve aspect ratio, scale to fit inside the anchor box.
    Fit,
    /// Preserve aspect ratio, scale to cover the anchor box.
    Fill,
    /// Fill the anchor box exactly, ignoring aspect ratio.
    Stretch,
}

impl Default for ImageFillMode {
    fn default() -> Self {
        ImageFillMode::Fit
    }
}

#[derive(Debug, Clone)]
pub struct SheetRenderOptions {
    pub fill_mode: ImageFillMode,
    /// Scale percentage applied on top of the computed fit/fill size.
    pub fill_percentage: u32,
}

impl Default for SheetRenderOptions {
    fn default() -> Self {
        Self {
            fill_mode: ImageFillMode::Fit,
            fill_percentage: 90,
        }
    }
}

/// True when the file opens as a spreadsheet package with at least one sheet.
pub fn is_valid_template(path: &Path) -> bool {
    match Archive::read(path, "spreadsheet") {
        Ok(archive) => {
            archive.contains("xl/workbook.xml")
                && archive.part_names().iter().any(|n| is_worksheet_part(n))
        }
        Err(_) => false,
    }
}

struct PendingImage {
    row: u32,
    col: u32,
    path: PathBuf,
}

/// Renders `template` to `output` with `data` substituted into every string
/// cell; `images` maps image-token names to files on disk. Reports fractional
/// progress once per processed sheet.
pub fn render(
    template: &Path,
    output: &Path,
    data: &HashMap<String, String>,
    images: Option<&HashMap<String, PathBuf>>,
    options: &SheetRenderOptions,
    mut progress: impl FnMut(f64),
) -> Result<()> {
    let mut archive = Archive::read(template, "spreadsheet")?;
    let shared = parse_shared_strings(&archive);

    let mut substitutions: Vec<(&String, &String)> = data.iter().collect();
    substitutions.sort();

    let sheet_names: Vec<String> = archive
        .part_names()
        .into_iter()
        .filter(|name| is_worksheet_part(name))
        .collect();
    if sheet_names.is_empty() {
        return Err(Error::Format {
            path: template.to_path_buf(),
            kind: "spreadsheet",
            message: "template contains no worksheets".to_string(),
        });
    }

    let total = sheet_names.len();
    for (index, name) in sheet_names.iter().enumerate() {
        let xml = archive.get_str(name).unwrap_or_default();
        let (rewritten, pending) = rewrite_cells(&xml, &shared, &substitutions, images)?;
        archive.set(name, rewritten.into_bytes());
        if !pending.is_empty() {
            insert_images(&mut archive, name, &pending, options)?;
        }
        progress((index + 1) as f64 / total as f64);
    }

    archive.write(output)
}

fn is_worksheet_part(name: &str) -> bool {
    name.starts_with("xl/worksheets/") && name.ends_with(".xml") && !name.contains("_rels")
}

fn parse_shared_strings(archive: &Archive) -> Vec<String> {
    let Some(xml) = archive.get_str("xl/sharedStrings.xml") else {
        return Vec::new();
    };
    SI_RE
        .captures_iter(&xml)
        .map(|si| {
            TEXT_RE
                .captures_iter(si.get(1).unwrap().as_str())
                .map(|t| ooxml::xml_unescape(t.get(1).unwrap().as_str()))
                .collect::<String>()
        })
        .collect()
}

/// Replaces tokens in every string cell of one sheet. Changed cells are
/// rewritten as inline strings with their style attribute kept; cells whose
/// full value is a bound image token are emptied and queued for insertion.
fn rewrite_cells(
    xml: &str,
    shared: &[String],
    substitutions: &[(&String, &String)],
    images: Option<&HashMap<String, PathBuf>>,
) -> Result<(String, Vec<PendingImage>)> {
    let mut pending = Vec::new();
    let rewritten = CELL_RE.replace_all(xml, |cap: &regex::Captures| {
        let cell = cap.get(0).unwrap().as_str();
        let Some(text) = cell_text(cell, shared) else {
            return cell.to_string();
        };

        let mut value = text.clone();
        for (field, replacement) in substitutions {
            let token = format!("{{{}}}", field);
            if value.contains(&token) {
                value = value.replace(&token, replacement);
            }
        }

        if let Some(name) = placeholder::image_token_name(&value) {
            if let Some(path) = images.and_then(|map| map.get(name)) {
                if path.exists() {
                    if let Some((row, col)) = cell_position(cell) {
                        pending.push(PendingImage {
                            row,
                            col,
                            path: path.clone(),
                        });
                        return cleared_cell(cell);
                    }
                    warn!("image token '{}' in a cell without a reference", name);
                }
            }
        }

        if value != text {
            inline_string_cell(cell, &value)
        } else {
            cell.to_string()
        }
    });
    Ok((rewritten.into_owned(), pending))
}

/// The cell's string value, or `None` for non-string cells.
fn cell_text(cell: &str, shared: &[String]) -> Option<String> {
    let cell_type = CELL_TYPE_RE
        .captures(cell)
        .map(|cap| cap.get(1).unwrap().as_str())
        .unwrap_or("");
    match cell_type {
        "s" => {
            let index: usize = VALUE_RE.captures(cell)?.get(1).unwrap().as_str().parse().ok()?;
            shared.get(index).cloned()
        }
        "inlineStr" => Some(
            TEXT_RE
                .captures_iter(cell)
                .map(|t| ooxml::xml_unescape(t.get(1).unwrap().as_str()))
                .collect(),
        ),
        _ => None,
    }
}

fn cell_position(cell: &str) -> Option<(u32, u32)> {
    let cap = CELL_REF_RE.captures(cell)?;
    let letters = cap.get(1).unwrap().as_str();
    let row: u32 = cap.get(2).unwrap().as_str().parse().ok()?;
    let mut col: u32 = 0;
    for c in letters.bytes() {
        col = col * 26 + u32::from(c - b'A') + 1;
    }
    Some((row.checked_sub(1)?, col.checked_sub(1)?))
}

/// Open-tag attributes with the `t` type attribute removed.
fn cell_attrs_without_type(cell: &str) -> String {
    let attrs = CELL_OPEN_RE
        .captures(cell)
        .map(|cap| cap.get(1).unwrap().as_str())
        .unwrap_or("");
    CELL_TYPE_RE.replace_all(attrs, "").trim_end().to_string()
}

fn inline_string_cell(cell: &str, value: &str) -> String {
    format!(
        "<c{} t=\"inlineStr\"><is><t xml:space=\"preserve\">{}</t></is></c>",
        cell_attrs_without_type(cell),
        ooxml::xml_escape(value)
    )
}

fn cleared_cell(cell: &str) -> String {
    format!("<c{}/>", cell_attrs_without_type(cell))
}

/// Anchors every queued picture on the sheet, creating the drawing part, its
/// relationships, and the PNG media entries as needed.
fn insert_images(
    archive: &mut Archive,
    sheet_name: &str,
    pending: &[PendingImage],
    options: &SheetRenderOptions,
) -> Result<()> {
    let (drawing_name, mut drawing_xml) = sheet_drawing_part(archive, sheet_name);
    let drawing_rels = ooxml::rels_name_for(&drawing_name);

    let mut anchors = String::new();
    let mut shape_id = drawing_xml.matches("<xdr:cNvPr ").count() as u32 + 1;
    for image in pending {
        let png = images::encode_png(&image.path)?;
        let media_index = ooxml::next_media_index(archive, "xl/media/");
        let media_name = format!("xl/media/image{}.png", media_index);
        archive.set(&media_name, png);
        ooxml::ensure_default_content_type(archive, "png", "image/png");
        let rel_id = ooxml::add_relationship(
            archive,
            &drawing_rels,
            IMAGE_REL_TYPE,
            &format!("../media/image{}.png", media_index),
        );
        anchors.push_str(&anchor_xml(image, &rel_id, shape_id, options));
        shape_id += 1;
    }

    drawing_xml = drawing_xml.replace("</xdr:wsDr>", &format!("{}</xdr:wsDr>", anchors));
    archive.set(&drawing_name, drawing_xml.into_bytes());
    Ok(())
}

/// The sheet's drawing part, created (and wired into the sheet, its rels and
/// the content types) when the sheet has none yet.
fn sheet_drawing_part(archive: &mut Archive, sheet_name: &str) -> (String, String) {
    let sheet_xml = archive.get_str(sheet_name).unwrap_or_default();
    let sheet_rels = ooxml::rels_name_for(sheet_name);

    if let Some(cap) = DRAWING_REF_RE.captures(&sheet_xml) {
        let rel_id = cap.get(1).unwrap().as_str();
        if let Some(rels) = archive.get_str(&sheet_rels) {
            let target_re =
                Regex::new(&format!(r#"Id="{}"[^>]*Target="([^"]+)""#, regex::escape(rel_id)))
                    .unwrap();
            if let Some(target) = target_re.captures(&rels) {
                let target = target.get(1).unwrap().as_str();
                let name = target.trim_start_matches("../");
                let name = format!("xl/{}", name);
                if let Some(xml) = archive.get_str(&name) {
                    return (name, xml);
                }
            }
        }
    }

    let mut index = 1;
    while archive.contains(&format!("xl/drawings/drawing{}.xml", index)) {
        index += 1;
    }
    let drawing_name = format!("xl/drawings/drawing{}.xml", index);
    let drawing_xml = concat!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
        r#"<xdr:wsDr xmlns:xdr="http://schemas.openxmlformats.org/drawingml/2006/spreadsheetDrawing" "#,
        r#"xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main" "#,
        r#"xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships">"#,
        "</xdr:wsDr>"
    )
    .to_string();
    ooxml::add_content_type_override(archive, &drawing_name, DRAWING_CONTENT_TYPE);

    let rel_id = ooxml::add_relationship(
        archive,
        &sheet_rels,
        DRAWING_REL_TYPE,
        &format!("../drawings/drawing{}.xml", index),
    );
    let updated = sheet_xml.replace(
        "</worksheet>",
        &format!("<drawing r:id=\"{}\"/></worksheet>", rel_id),
    );
    archive.set(sheet_name, updated.into_bytes());
    (drawing_name, drawing_xml)
}

fn anchor_xml(
    image: &PendingImage,
    rel_id: &str,
    shape_id: u32,
    options: &SheetRenderOptions,
) -> String {
    let box_width = (CELL_BOX_WIDTH_PX * EMU_PER_PIXEL as f64) as i64;
    let box_height = (CELL_BOX_HEIGHT_PX * EMU_PER_PIXEL as f64) as i64;
    let percentage = f64::from(options.fill_percentage.max(1)) / 100.0;

    let picture = |cx: i64, cy: i64| {
        format!(
            concat!(
                "<xdr:pic><xdr:nvPicPr>",
                "<xdr:cNvPr id=\"{id}\" name=\"Picture {id}\"/><xdr:cNvPicPr/>",
                "</xdr:nvPicPr><xdr:blipFill><a:blip r:embed=\"{rel}\"/>",
                "<a:stretch><a:fillRect/></a:stretch></xdr:blipFill>",
                "<xdr:spPr><a:xfrm><a:off x=\"0\" y=\"0\"/><a:ext cx=\"{cx}\" cy=\"{cy}\"/></a:xfrm>",
                "<a:prstGeom prst=\"rect\"><a:avLst/></a:prstGeom></xdr:spPr></xdr:pic>"
            ),
            id = shape_id,
            rel = rel_id,
            cx = cx,
            cy = cy
        )
    };

    match options.fill_mode {
        ImageFillMode::Stretch => format!(
            concat!(
                "<xdr:twoCellAnchor editAs=\"oneCell\">",
                "<xdr:from><xdr:col>{col}</xdr:col><xdr:colOff>0</xdr:colOff>",
                "<xdr:row>{row}</xdr:row><xdr:rowOff>0</xdr:rowOff></xdr:from>",
                "<xdr:to><xdr:col>{col2}</xdr:col><xdr:colOff>0</xdr:colOff>",
                "<xdr:row>{row2}</xdr:row><xdr:rowOff>0</xdr:rowOff></xdr:to>",
                "{pic}<xdr:clientData/></xdr:twoCellAnchor>"
            ),
            col = image.col,
            row = image.row,
            col2 = image.col + 1,
            row2 = image.row + 1,
            pic = picture(box_width, box_height)
        ),
        mode => {
            let (width, height) = images::image_size(&image.path).unwrap_or((
                CELL_BOX_WIDTH_PX as u32,
                CELL_BOX_HEIGHT_PX as u32,
            ));
            let scale_x = box_width as f64 / f64::from(width.max(1)) / EMU_PER_PIXEL as f64;
            let scale_y = box_height as f64 / f64::from(height.max(1)) / EMU_PER_PIXEL as f64;
            let scale = match mode {
                ImageFillMode::Fit => scale_x.min(scale_y),
                _ => scale_x.max(scale_y),
            } * percentage;
            let cx = (f64::from(width) * scale * EMU_PER_PIXEL as f64) as i64;
            let cy = (f64::from(height) * scale * EMU_PER_PIXEL as f64) as i64;
            format!(
                concat!(
                    "<xdr:oneCellAnchor>",
                    "<xdr:from><xdr:col>{col}</xdr:col><xdr:colOff>0</xdr:colOff>",
                    "<xdr:row>{row}</xdr:row><xdr:rowOff>0</xdr:rowOff></xdr:from>",
                    "<xdr:ext cx=\"{cx}\" cy=\"{cy}\"/>",
                    "{pic}<xdr:clientData/></xdr:oneCellAnchor>"
                ),
                col = image.col,
                row = image.row,
                cx = cx,
                cy = cy,
                pic = picture(cx, cy)
            )
        }
    }
}
