use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::doc_template::{DocRenderOptions, PostProcessing, RunStyle};
use crate::images::ImageSourceDir;
use crate::sheet_template::{ImageFillMode, SheetRenderOptions};

#[derive(Debug, Deserialize)]
pub struct JobConfig {
    pub data: DataConfig,
    pub output_dir: PathBuf,

    pub doc_template: Option<PathBuf>,
    pub sheet_template: Option<PathBuf>,

    #[serde(default = "default_output_name_template")]
    pub output_name_template: String,

    #[serde(default)]
    pub images: ImageConfig,

    #[serde(default)]
    pub id_extraction: IdExtractionConfig,

    #[serde(default)]
    pub doc_style: Option<RunStyle>,

    #[serde(default)]
    pub picture: PictureConfig,

    #[serde(default)]
    pub post: PostConfig,
}

fn default_output_name_template() -> String {
    "{序号}_{姓名}_{时间}".to_string()
}

#[derive(Debug, Deserialize)]
pub struct DataConfig {
    /// Input workbooks, read in order.
    pub files: Vec<PathBuf>,
    /// Merge all sheets of all files on `key_column` instead of using the
    /// first sheet of the first file.
    #[serde(default)]
    pub multi_table: bool,
    #[serde(default)]
    pub key_column: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub fill_mode: ImageFillMode,
    #[serde(default = "default_fill_percentage")]
    pub fill_percentage: u32,
    #[serde(default)]
    pub directories: Vec<ImageSourceDir>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            fill_mode: ImageFillMode::default(),
            fill_percentage: default_fill_percentage(),
            directories: Vec::new(),
        }
    }
}

fn default_fill_percentage() -> u32 {
    90
}

#[derive(Debug, Deserialize, Default)]
pub struct IdExtractionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub column: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PictureConfig {
    #[serde(default = "default_picture_width")]
    pub width_pt: f64,
    #[serde(default = "default_picture_height")]
    pub height_pt: f64,
    #[serde(default = "default_picture_center")]
    pub center: bool,
}

impl Default for PictureConfig {
    fn default() -> Self {
        Self {
            width_pt: default_picture_width(),
            height_pt: default_picture_height(),
            center: default_picture_center(),
        }
    }
}

fn default_picture_width() -> f64 {
    250.0
}

fn default_picture_height() -> f64 {
    150.0
}

fn default_picture_center() -> bool {
    true
}

#[derive(Debug, Deserialize, Default)]
pub struct PostConfig {
    #[serde(default)]
    pub expand_rows: bool,
    #[serde(default)]
    pub footer_page_numbers: bool,
    #[serde(default)]
    pub table_of_contents: bool,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl JobConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: JobConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Flow-document renderer options; `row_records` feeds table-row
    /// expansion when that step is enabled.
    pub fn doc_options(
        &self,
        row_records: Vec<std::collections::HashMap<String, String>>,
    ) -> DocRenderOptions {
        DocRenderOptions {
            run_style: self.doc_style.clone(),
            picture_width_pt: self.picture.width_pt,
            picture_height_pt: self.picture.height_pt,
            center_images: self.picture.center,
            post: PostProcessing {
                expand_rows: self.post.expand_rows,
                row_records: if self.post.expand_rows {
                    row_records
                } else {
                    Vec::new()
                },
                footer_page_numbers: self.post.footer_page_numbers,
                table_of_contents: self.post.table_of_contents,
            },
        }
    }

    pub fn sheet_options(&self) -> SheetRenderOptions {
        SheetRenderOptions {
            fill_mode: self.images.fill_mode,
            fill_percentage: self.images.fill_percentage,
        }
    }
}
