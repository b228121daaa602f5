//! Per-row batch generation.
//!
//! Rows are processed strictly sequentially. Renderer failures are counted
//! and never stop the batch; only up-front validation aborts before the
//! first row. Cancellation is cooperative and checked once per row.

use chrono::Local;
use log::{error, info};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::doc_template::{self, DocRenderOptions, LogEntry};
use crate::error::{Error, Result};
use crate::images::{self, ImageSourceDir};
use crate::naming::{self, DATE_FIELD, DATE_FORMAT, SEQUENCE_FIELD, TIMESTAMP_FIELD, TIMESTAMP_FORMAT};
use crate::idcard;
use crate::sheet_template::{self, SheetRenderOptions};

/// Cooperative cancellation flag shared between the batch loop and its
/// caller. Cancelling stops the loop at the next row boundary; rows not
/// reached are neither rendered nor counted as failures.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Everything one batch run needs, assembled by the caller from config and
/// loaded data.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub rows: Vec<HashMap<String, String>>,
    pub output_dir: PathBuf,
    pub doc_template: Option<PathBuf>,
    pub sheet_template: Option<PathBuf>,
    /// `{field}` name template for output file stems.
    pub output_name_template: String,
    pub doc_options: DocRenderOptions,
    pub sheet_options: SheetRenderOptions,
    pub use_images: bool,
    pub image_dirs: Vec<ImageSourceDir>,
    /// Column holding an ID number to derive auxiliary fields from.
    pub id_source_column: Option<String>,
    /// Log what would be generated without writing any file.
    pub dry_run: bool,
}

#[derive(Debug, Default)]
pub struct BatchSummary {
    pub success_count: usize,
    pub failure_count: usize,
    /// Rows actually reached before completion or cancellation.
    pub processed: usize,
    pub total: usize,
    pub log_entries: Vec<LogEntry>,
}

impl BatchSummary {
    pub fn is_success(&self) -> bool {
        self.failure_count == 0
    }
}

/// Runs the batch, reporting `(processed, total)` after each row.
pub fn run(
    request: &BatchRequest,
    cancel: &CancellationToken,
    progress: impl FnMut(usize, usize),
) -> Result<BatchSummary> {
    run_with_renderers(
        request,
        cancel,
        progress,
        |template, output, data, bindings, options| {
            doc_template::render(template, output, data, bindings, options)
        },
        |template, output, data, bindings, options| {
            sheet_template::render(template, output, data, bindings, options, |_| {})
        },
    )
}

type ImageBindings<'a> = Option<&'a HashMap<String, PathBuf>>;

/// The batch loop with the two renderer calls injected, so failure handling
/// can be exercised without real templates.
fn run_with_renderers(
    request: &BatchRequest,
    cancel: &CancellationToken,
    mut progress: impl FnMut(usize, usize),
    mut render_doc: impl FnMut(
        &Path,
        &Path,
        &HashMap<String, String>,
        ImageBindings,
        &DocRenderOptions,
    ) -> Result<Vec<LogEntry>>,
    mut render_sheet: impl FnMut(
        &Path,
        &Path,
        &HashMap<String, String>,
        ImageBindings,
        &SheetRenderOptions,
    ) -> Result<()>,
) -> Result<BatchSummary> {
    std::fs::create_dir_all(&request.output_dir).map_err(|e| {
        Error::Validation(format!(
            "cannot create output directory {:?}: {}",
            request.output_dir, e
        ))
    })?;
    if request.doc_template.is_none() && request.sheet_template.is_none() {
        return Err(Error::Validation("no template configured".to_string()));
    }
    if request.rows.is_empty() {
        return Err(Error::Validation("no data rows to process".to_string()));
    }

    let mut summary = BatchSummary {
        total: request.rows.len(),
        ..BatchSummary::default()
    };

    for (index, row) in request.rows.iter().enumerate() {
        if cancel.is_cancelled() {
            info!("cancelled after {} of {} rows", index, summary.total);
            break;
        }

        let now = Local::now();
        let mut data = row.clone();
        data.insert(SEQUENCE_FIELD.to_string(), (index + 1).to_string());
        data.insert(
            TIMESTAMP_FIELD.to_string(),
            now.format(TIMESTAMP_FORMAT).to_string(),
        );
        data.insert(DATE_FIELD.to_string(), now.format(DATE_FORMAT).to_string());

        if let Some(column) = &request.id_source_column {
            if let Some(value) = row.get(column) {
                if !value.trim().is_empty() {
                    idcard::extract_fields(value, &mut data);
                }
            }
        }

        let bindings = if request.use_images && !request.image_dirs.is_empty() {
            Some(images::build_bindings(&request.image_dirs, &data))
        } else {
            None
        };

        let base_name = naming::output_base_name(&request.output_name_template, &data, index, &now);

        if let Some(template) = &request.doc_template {
            let output = request.output_dir.join(format!("{}.docx", base_name));
            if request.dry_run {
                info!("dry-run: would write {:?}", output);
                summary.success_count += 1;
            } else {
                match render_doc(template, &output, &data, bindings.as_ref(), &request.doc_options)
                {
                    Ok(mut entries) => {
                        summary.success_count += 1;
                        summary.log_entries.append(&mut entries);
                    }
                    Err(e) => {
                        error!("row {}: document render failed: {}", index + 1, e);
                        summary.failure_count += 1;
                    }
                }
            }
        }

        if let Some(template) = &request.sheet_template {
            let output = request.output_dir.join(format!("{}.xlsx", base_name));
            if request.dry_run {
                info!("dry-run: would write {:?}", output);
                summary.success_count += 1;
            } else {
                match render_sheet(
                    template,
                    &output,
                    &data,
                    bindings.as_ref(),
                    &request.sheet_options,
                ) {
                    Ok(()) => summary.success_count += 1,
                    Err(e) => {
                        error!("row {}: sheet render failed: {}", index + 1, e);
                        summary.failure_count += 1;
                    }
                }
            }
        }

        summary.processed = index + 1;
        progress(summary.processed, summary.total);
    }

    Ok(summary)
}
