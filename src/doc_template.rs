//! Flow-document template renderer.
//!
//! Run text is rewritten across the body, every table cell, and every header
//! and footer part. Runs whose whole text is an image token become inline
//! picture runs. Every substitution attempt is recorded as a log entry; a
//! failed field never aborts the document.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::images;
use crate::ooxml::{self, Archive};
use crate::placeholder;

const IMAGE_REL_TYPE: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/image";

const EMU_PER_POINT: i64 = 12700;

static PARAGRAPH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<w:p(?:>|\s[^>]*[^/]>).*?</w:p>").unwrap());
static RUN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<w:r(?:>|\s[^>]*[^/]>).*?</w:r>").unwrap());
static RUN_PROPS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<w:rPr\s*/>|<w:rPr(?:>|\s[^>]*[^/]>).*?</w:rPr>").unwrap());
static TABLE_ROW_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<w:tr(?:>|\s[^>]*[^/]>).*?</w:tr>").unwrap());
static ROW_TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{Row\.([^{}]+)\}").unwrap());

/// Outcome of one substitution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubstitutionStatus {
    Replaced,
    Inserted,
    Error,
}

/// One substitution attempt: which field, in which document part, and how it
/// went.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub field: String,
    pub location: String,
    pub status: SubstitutionStatus,
}

/// Character formatting applied to every replaced run. Unset members leave
/// the run's original formatting alone only when no style is configured at
/// all; a configured style replaces the run properties wholesale.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunStyle {
    #[serde(default)]
    pub font: Option<String>,
    #[serde(default)]
    pub size_pt: Option<f64>,
    #[serde(default)]
    pub bold: bool,
    #[serde(default)]
    pub italic: bool,
    /// Hex RGB, with or without a leading `#`.
    #[serde(default)]
    pub color: Option<String>,
}

/// Post-substitution steps, each independently toggleable.
#[derive(Debug, Clone, Default)]
pub struct PostProcessing {
    /// Duplicate table rows carrying `{Row.field}` tokens once per record.
    pub expand_rows: bool,
    pub row_records: Vec<HashMap<String, String>>,
    /// Append a centered `PAGE` field paragraph to every footer.
    pub footer_page_numbers: bool,
    /// Insert a table-of-contents field at the start of the body.
    pub table_of_contents: bool,
}

#[derive(Debug, Clone)]
pub struct DocRenderOptions {
    pub run_style: Option<RunStyle>,
    pub picture_width_pt: f64,
    pub picture_height_pt: f64,
    pub center_images: bool,
    pub post: PostProcessing,
}

impl Default for DocRenderOptions {
    fn default() -> Self {
        Self {
            run_style: None,
            picture_width_pt: 250.0,
            picture_height_pt: 150.0,
            center_images: true,
            post: PostProcessing::default(),
        }
    }
}

/// True when the file opens as a flow-document package with a body part.
pub fn is_valid_template(path: &Path) -> bool {
    match Archive::read(path, "document") {
        Ok(archive) => archive.contains("word/document.xml"),
        Err(_) => false,
    }
}

struct PendingPicture {
    field: String,
    location: String,
    path: PathBuf,
    marker: String,
    original_run: String,
}

/// Renders `template` to `output`, substituting `data` into every run and
/// `images` bindings into image-token runs, then applies the configured
/// post-processing. Returns the substitution log.
pub fn render(
    template: &Path,
    output: &Path,
    data: &HashMap<String, String>,
    images: Option<&HashMap<String, PathBuf>>,
    options: &DocRenderOptions,
) -> Result<Vec<LogEntry>> {
    let mut archive = Archive::read(template, "document")?;
    let mut log = Vec::new();

    let mut substitutions: Vec<(&String, &String)> = data.iter().collect();
    substitutions.sort();

    let parts: Vec<String> = archive
        .part_names()
        .into_iter()
        .filter(|name| ooxml::is_document_text_part(name))
        .collect();

    let mut picture_id = 1u32;
    for name in &parts {
        let Some(xml) = archive.get_str(name) else {
            continue;
        };
        let location = part_label(name);
        let mut pending = Vec::new();
        let mut rewritten = rewrite_paragraphs(
            &xml,
            &location,
            &substitutions,
            images,
            options,
            &mut log,
            &mut pending,
        );

        for picture in pending {
            match images::encode_png(&picture.path) {
                Ok(png) => {
                    let media_index = ooxml::next_media_index(&archive, "word/media/");
                    archive.set(&format!("word/media/image{}.png", media_index), png);
                    ooxml::ensure_default_content_type(&mut archive, "png", "image/png");
                    let rel_id = ooxml::add_relationship(
                        &mut archive,
                        &ooxml::rels_name_for(name),
                        IMAGE_REL_TYPE,
                        &format!("media/image{}.png", media_index),
                    );
                    let run = picture_run(&rel_id, picture_id, options);
                    picture_id += 1;
                    rewritten = rewritten.replace(&picture.marker, &run);
                    log.push(LogEntry {
                        field: picture.field,
                        location: picture.location,
                        status: SubstitutionStatus::Inserted,
                    });
                }
                Err(e) => {
                    log::warn!("cannot insert image for '{}': {}", picture.field, e);
                    rewritten = rewritten.replace(&picture.marker, &picture.original_run);
                    log.push(LogEntry {
                        field: picture.field,
                        location: picture.location,
                        status: SubstitutionStatus::Error,
                    });
                }
            }
        }
        archive.set(name, rewritten.into_bytes());
    }

    apply_post_processing(&mut archive, &parts, options)?;

    archive.write(output)?;
    Ok(log)
}

fn part_label(name: &str) -> String {
    name.rsplit('/')
        .next()
        .unwrap_or(name)
        .trim_end_matches(".xml")
        .to_string()
}

/// Rewrites every paragraph of one part. Image-token runs are swapped for
/// unique comment markers and queued; the caller wires the media and replaces
/// the markers once the image bytes are known good.
fn rewrite_paragraphs(
    xml: &str,
    location: &str,
    substitutions: &[(&String, &String)],
    images: Option<&HashMap<String, PathBuf>>,
    options: &DocRenderOptions,
    log: &mut Vec<LogEntry>,
    pending: &mut Vec<PendingPicture>,
) -> String {
    PARAGRAPH_RE
        .replace_all(xml, |paragraph: &regex::Captures| {
            let paragraph = paragraph.get(0).unwrap().as_str();
            let mut has_picture = false;
            let rewritten = RUN_RE.replace_all(paragraph, |run: &regex::Captures| {
                let run = run.get(0).unwrap().as_str();
                let text: String = ooxml::run_texts(run).concat();
                if !text.contains('{') {
                    return run.to_string();
                }

                if let Some(name) = placeholder::image_token_name(&text) {
                    if let Some(path) = images.and_then(|map| map.get(name)) {
                        if path.exists() {
                            let marker = format!("<!--picture-slot-{}-->", pending.len());
                            pending.push(PendingPicture {
                                field: name.to_string(),
                                location: location.to_string(),
                                path: path.clone(),
                                marker: marker.clone(),
                                original_run: run.to_string(),
                            });
                            has_picture = true;
                            return marker;
                        }
                    }
                }

                let mut value = text.clone();
                for (field, replacement) in substitutions {
                    let token = format!("{{{}}}", field);
                    if value.contains(&token) {
                        value = value.replace(&token, replacement);
                        log.push(LogEntry {
                            field: (*field).clone(),
                            location: location.to_string(),
                            status: SubstitutionStatus::Replaced,
                        });
                    }
                }
                if value == text {
                    return run.to_string();
                }
                rebuild_run(run, &value, options.run_style.as_ref())
            });

            let mut paragraph = rewritten.into_owned();
            if has_picture && options.center_images {
                paragraph = center_paragraph(&paragraph);
            }
            paragraph
        })
        .into_owned()
}

/// A run with its text replaced; run properties come from the configured
/// style, or are carried over from the original run when none is set.
fn rebuild_run(run: &str, text: &str, style: Option<&RunStyle>) -> String {
    let props = match style {
        Some(style) => style_properties(style),
        None => RUN_PROPS_RE
            .find(run)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default(),
    };
    format!(
        "<w:r>{}<w:t xml:space=\"preserve\">{}</w:t></w:r>",
        props,
        ooxml::xml_escape(text)
    )
}

fn style_properties(style: &RunStyle) -> String {
    let mut props = String::new();
    if let Some(font) = &style.font {
        let font = ooxml::xml_escape(font);
        props.push_str(&format!(
            "<w:rFonts w:ascii=\"{f}\" w:eastAsia=\"{f}\" w:hAnsi=\"{f}\"/>",
            f = font
        ));
    }
    if style.bold {
        props.push_str("<w:b/>");
    }
    if style.italic {
        props.push_str("<w:i/>");
    }
    if let Some(color) = &style.color {
        props.push_str(&format!(
            "<w:color w:val=\"{}\"/>",
            ooxml::xml_escape(color.trim_start_matches('#'))
        ));
    }
    if let Some(size_pt) = style.size_pt {
        let half_points = (size_pt * 2.0).round() as u32;
        props.push_str(&format!(
            "<w:sz w:val=\"{v}\"/><w:szCs w:val=\"{v}\"/>",
            v = half_points
        ));
    }
    if props.is_empty() {
        String::new()
    } else {
        format!("<w:rPr>{}</w:rPr>", props)
    }
}

fn center_paragraph(paragraph: &str) -> String {
    if paragraph.contains("<w:jc ") {
        return paragraph.to_string();
    }
    if let Some(index) = paragraph.find("<w:pPr>") {
        let insert_at = index + "<w:pPr>".len();
        let mut out = paragraph.to_string();
        out.insert_str(insert_at, "<w:jc w:val=\"center\"/>");
        return out;
    }
    // the open tag may carry attributes
    if let Some(end) = paragraph.find('>') {
        let mut out = paragraph.to_string();
        out.insert_str(end + 1, "<w:pPr><w:jc w:val=\"center\"/></w:pPr>");
        return out;
    }
    paragraph.to_string()
}

fn picture_run(rel_id: &str, picture_id: u32, options: &DocRenderOptions) -> String {
    let cx = (options.picture_width_pt * EMU_PER_POINT as f64) as i64;
    let cy = (options.picture_height_pt * EMU_PER_POINT as f64) as i64;
    format!(
        concat!(
            "<w:r><w:drawing>",
            "<wp:inline distT=\"0\" distB=\"0\" distL=\"0\" distR=\"0\" ",
            "xmlns:wp=\"http://schemas.openxmlformats.org/drawingml/2006/wordprocessingDrawing\">",
            "<wp:extent cx=\"{cx}\" cy=\"{cy}\"/>",
            "<wp:docPr id=\"{id}\" name=\"Picture {id}\"/>",
            "<a:graphic xmlns:a=\"http://schemas.openxmlformats.org/drawingml/2006/main\">",
            "<a:graphicData uri=\"http://schemas.openxmlformats.org/drawingml/2006/picture\">",
            "<pic:pic xmlns:pic=\"http://schemas.openxmlformats.org/drawingml/2006/picture\">",
            "<pic:nvPicPr><pic:cNvPr id=\"{id}\" name=\"Picture {id}\"/><pic:cNvPicPr/></pic:nvPicPr>",
            "<pic:blipFill>",
            "<a:blip xmlns:r=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships\" r:embed=\"{rel}\"/>",
            "<a:stretch><a:fillRect/></a:stretch></pic:blipFill>",
            "<pic:spPr><a:xfrm><a:off x=\"0\" y=\"0\"/><a:ext cx=\"{cx}\" cy=\"{cy}\"/></a:xfrm>",
            "<a:prstGeom prst=\"rect\"><a:avLst/></a:prstGeom></pic:spPr>",
            "</pic:pic></a:graphicData></a:graphic></wp:inline></w:drawing></w:r>"
        ),
        cx = cx,
        cy = cy,
        id = picture_id,
        rel = rel_id
    )
}

fn apply_post_processing(
    archive: &mut Archive,
    parts: &[String],
    options: &DocRenderOptions,
) -> Result<()> {
    if options.post.expand_rows {
        if let Some(xml) = archive.get_str("word/document.xml") {
            let expanded = expand_table_rows(&xml, &options.post.row_records);
            archive.set("word/document.xml", expanded.into_bytes());
        }
    }
    if options.post.footer_page_numbers {
        for name in parts {
            if !name.starts_with("word/footer") {
                continue;
            }
            if let Some(xml) = archive.get_str(name) {
                let field = "<w:p><w:pPr><w:jc w:val=\"center\"/></w:pPr>\
                             <w:fldSimple w:instr=\" PAGE \"/></w:p>";
                let updated = xml.replace("</w:ftr>", &format!("{}</w:ftr>", field));
                archive.set(name, updated.into_bytes());
            }
        }
    }
    if options.post.table_of_contents {
        if let Some(xml) = archive.get_str("word/document.xml") {
            let toc =
                "<w:p><w:fldSimple w:instr=\" TOC \\o &quot;1-3&quot; \\h \\z \\u \"/></w:p>";
            let updated = xml.replacen("<w:body>", &format!("<w:body>{}", toc), 1);
            archive.set("word/document.xml", updated.into_bytes());
        }
    }
    Ok(())
}

/// Duplicates every table row carrying `{Row.field}` tokens once per record,
/// substituting the tokens, and drops the template row.
fn expand_table_rows(xml: &str, records: &[HashMap<String, String>]) -> String {
    TABLE_ROW_RE
        .replace_all(xml, |row: &regex::Captures| {
            let row = row.get(0).unwrap().as_str();
            if !ROW_TOKEN_RE.is_match(row) {
                return row.to_string();
            }
            let mut expanded = String::new();
            for record in records {
                let filled = ROW_TOKEN_RE.replace_all(row, |token: &regex::Captures| {
                    let field = token.get(1).unwrap().as_str();
                    record
                        .get(field)
                        .map(|value| ooxml::xml_escape(value))
                        .unwrap_or_else(|| token.get(0).unwrap().as_str().to_string())
                });
                expanded.push_str(&filled);
            }
            expanded
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ooxml::fixtures::write_minimal_docx;
    use tempfile::tempdir;

    fn data(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_substitutes_body_header_and_footer() {
        let dir = tempdir().unwrap();
        let template = dir.path().join("t.docx");
        let output = dir.path().join("out.docx");
        write_minimal_docx(
            &template,
            &["Hello {name}", "untouched"],
            Some("Header {name}"),
            Some("Footer {name}"),
        );

        let log = render(
            &template,
            &output,
            &data(&[("name", "Alice")]),
            None,
            &DocRenderOptions::default(),
        )
        .unwrap();

        let rendered = Archive::read(&output, "document").unwrap();
        let body = rendered.get_str("word/document.xml").unwrap();
        assert!(body.contains("Hello Alice"));
        assert!(body.contains("untouched"));
        assert!(rendered
            .get_str("word/header1.xml")
            .unwrap()
            .contains("Header Alice"));
        assert!(rendered
            .get_str("word/footer1.xml")
            .unwrap()
            .contains("Footer Alice"));

        let locations: Vec<&str> = log.iter().map(|e| e.location.as_str()).collect();
        assert_eq!(locations, vec!["document", "header1", "footer1"]);
        assert!(log
            .iter()
            .all(|e| e.field == "name" && e.status == SubstitutionStatus::Replaced));
    }

    #[test]
    fn test_image_run_requires_full_text_match() {
        let dir = tempdir().unwrap();
        let template = dir.path().join("t.docx");
        let output = dir.path().join("out.docx");
        write_minimal_docx(&template, &["{photo.img}", "see {photo.img}"], None, None);
        let png = dir.path().join("photo.png");
        image::RgbaImage::new(3, 3).save(&png).unwrap();
        let bindings = HashMap::from([("photo".to_string(), png)]);

        let log = render(
            &template,
            &output,
            &HashMap::new(),
            Some(&bindings),
            &DocRenderOptions::default(),
        )
        .unwrap();

        let rendered = Archive::read(&output, "document").unwrap();
        let body = rendered.get_str("word/document.xml").unwrap();
        assert!(body.contains("<w:drawing>"));
        assert!(!body.contains(">{photo.img}</w:t>"));
        assert!(body.contains("see {photo.img}"));
        // the picture paragraph got centered
        assert!(body.contains("<w:jc w:val=\"center\"/>"));
        assert!(rendered.contains("word/media/image1.png"));
        let rels = rendered.get_str("word/_rels/document.xml.rels").unwrap();
        assert!(rels.contains("media/image1.png"));
        assert_eq!(
            log,
            vec![LogEntry {
                field: "photo".to_string(),
                location: "document".to_string(),
                status: SubstitutionStatus::Inserted,
            }]
        );
    }

    #[test]
    fn test_unbound_image_token_is_left_alone() {
        let dir = tempdir().unwrap();
        let template = dir.path().join("t.docx");
        let output = dir.path().join("out.docx");
        write_minimal_docx(&template, &["{photo.img}"], None, None);

        let log = render(
            &template,
            &output,
            &HashMap::new(),
            Some(&HashMap::new()),
            &DocRenderOptions::default(),
        )
        .unwrap();

        let rendered = Archive::read(&output, "document").unwrap();
        let body = rendered.get_str("word/document.xml").unwrap();
        assert!(body.contains("{photo.img}"));
        assert!(log.is_empty());
    }

    #[test]
    fn test_configured_style_applies_to_replaced_runs_only() {
        let dir = tempdir().unwrap();
        let template = dir.path().join("t.docx");
        let output = dir.path().join("out.docx");
        write_minimal_docx(&template, &["{name}", "plain"], None, None);

        let options = DocRenderOptions {
            run_style: Some(RunStyle {
                font: Some("宋体".to_string()),
                size_pt: Some(12.0),
                bold: true,
                italic: false,
                color: Some("#FF0000".to_string()),
            }),
            ..DocRenderOptions::default()
        };
        render(&template, &output, &data(&[("name", "Alice")]), None, &options).unwrap();

        let body = Archive::read(&output, "document")
            .unwrap()
            .get_str("word/document.xml")
            .unwrap();
        assert!(body.contains("<w:rFonts w:ascii=\"宋体\""));
        assert!(body.contains("<w:sz w:val=\"24\"/>"));
        assert!(body.contains("<w:b/>"));
        assert!(body.contains("<w:color w:val=\"FF0000\"/>"));
        // exactly one styled run
        assert_eq!(body.matches("<w:rPr>").count(), 1);
    }

    #[test]
    fn test_round_trip_with_empty_map() {
        let dir = tempdir().unwrap();
        let template = dir.path().join("t.docx");
        let output = dir.path().join("out.docx");
        write_minimal_docx(&template, &["one {kept}", "two"], Some("h"), Some("f"));

        render(
            &template,
            &output,
            &HashMap::new(),
            None,
            &DocRenderOptions::default(),
        )
        .unwrap();

        let before = Archive::read(&template, "document").unwrap();
        let after = Archive::read(&output, "document").unwrap();
        assert_eq!(before.part_names(), after.part_names());
        for name in before.part_names() {
            assert_eq!(before.get(&name), after.get(&name), "part {} changed", name);
        }
    }

    #[test]
    fn test_expand_table_rows() {
        let xml = "<w:tbl><w:tr><w:tc><w:p><w:r><w:t>head</w:t></w:r></w:p></w:tc></w:tr>\
                   <w:tr><w:tc><w:p><w:r><w:t>{Row.name}</w:t></w:r></w:p></w:tc></w:tr></w:tbl>";
        let records = vec![
            HashMap::from([("name".to_string(), "Alice".to_string())]),
            HashMap::from([("name".to_string(), "Bob".to_string())]),
        ];
        let expanded = expand_table_rows(xml, &records);
        assert!(expanded.contains(">Alice<"));
        assert!(expanded.contains(">Bob<"));
        assert!(!expanded.contains("{Row.name}"));
        // the plain header row is untouched
        assert!(expanded.contains(">head<"));
        assert_eq!(expanded.matches("<w:tr>").count(), 3);
    }

    #[test]
    fn test_footer_page_number_and_toc() {
        let dir = tempdir().unwrap();
        let template = dir.path().join("t.docx");
        let output = dir.path().join("out.docx");
        write_minimal_docx(&template, &["body"], None, Some("f"));

        let options = DocRenderOptions {
            post: PostProcessing {
                footer_page_numbers: true,
                table_of_contents: true,
                ..PostProcessing::default()
            },
            ..DocRenderOptions::default()
        };
        render(&template, &output, &HashMap::new(), None, &options).unwrap();

        let rendered = Archive::read(&output, "document").unwrap();
        let footer = rendered.get_str("word/footer1.xml").unwrap();
        assert!(footer.contains("w:instr=\" PAGE \""));
        let body = rendered.get_str("word/document.xml").unwrap();
        let toc_at = body.find(" TOC ").unwrap();
        assert!(toc_at < body.find(">body<").unwrap());
    }
}
