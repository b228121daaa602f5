use log::warn;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Extensions the image decoder accepts.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "bmp", "gif", "webp", "tif", "tiff", "ico",
];

/// A directory of images matched to rows by file stem.
///
/// The directory contributes one binding named after the directory itself:
/// a template token `{name.img}` resolves to the file whose stem equals the
/// row's value in `matching_column`.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageSourceDir {
    pub path: PathBuf,
    pub matching_column: String,
    /// Binding name; defaults to the directory's file name.
    #[serde(default)]
    pub name: Option<String>,
}

impl ImageSourceDir {
    pub fn binding_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
    }
}

/// Supported image files directly under `dir`, sorted by file name.
pub fn list_image_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| {
                        let lower = ext.to_ascii_lowercase();
                        SUPPORTED_EXTENSIONS.contains(&lower.as_str())
                    })
                    .unwrap_or(false)
        })
        .collect();
    files.sort();
    files
}

/// Pixel dimensions, or `None` when the file cannot be decoded.
pub fn image_size(path: &Path) -> Option<(u32, u32)> {
    match image::image_dimensions(path) {
        Ok(size) => Some(size),
        Err(e) => {
            warn!("cannot read image dimensions of {:?}: {}", path, e);
            None
        }
    }
}

/// Re-encodes any supported image to PNG bytes.
pub fn encode_png(path: &Path) -> Result<Vec<u8>> {
    let img = image::open(path)?;
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(bytes)
}

/// Builds the per-row field-to-image-path bindings from the configured image
/// directories: each directory whose matching column holds a non-empty value
/// with a same-stemmed file contributes one binding under its own name.
pub fn build_bindings(
    dirs: &[ImageSourceDir],
    row: &HashMap<String, String>,
) -> HashMap<String, PathBuf> {
    let mut bindings = HashMap::new();
    for dir in dirs {
        let Some(value) = row.get(&dir.matching_column) else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        let matched = list_image_files(&dir.path).into_iter().find(|path| {
            path.file_stem()
                .and_then(|stem| stem.to_str())
                .map(|stem| stem == value)
                .unwrap_or(false)
        });
        if let Some(path) = matched {
            bindings.insert(dir.binding_name(), path);
        }
    }
    bindings
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_png(path: &Path, width: u32, height: u32) {
        image::RgbaImage::new(width, height).save(path).unwrap();
    }

    // the JPEG encoder accepts Rgb8 but not Rgba8
    fn write_jpg(path: &Path, width: u32, height: u32) {
        image::RgbImage::new(width, height).save(path).unwrap();
    }

    #[test]
    fn test_list_image_files_filters_extensions() {
        let dir = tempdir().unwrap();
        write_png(&dir.path().join("a.png"), 2, 2);
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        write_png(&dir.path().join("b.PNG"), 2, 2);

        let files = list_image_files(dir.path());
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn test_image_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("img.png");
        write_png(&path, 8, 4);
        assert_eq!(image_size(&path), Some((8, 4)));
        assert_eq!(image_size(&dir.path().join("missing.png")), None);
    }

    #[test]
    fn test_build_bindings_matches_by_stem() {
        let dir = tempdir().unwrap();
        let photos = dir.path().join("照片");
        std::fs::create_dir(&photos).unwrap();
        write_png(&photos.join("Alice.png"), 2, 2);
        write_jpg(&photos.join("Bob.jpg"), 2, 2);

        let sources = vec![ImageSourceDir {
            path: photos.clone(),
            matching_column: "姓名".to_string(),
            name: None,
        }];
        let row = HashMap::from([("姓名".to_string(), "Bob".to_string())]);
        let bindings = build_bindings(&sources, &row);
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings["照片"], photos.join("Bob.jpg"));

        let row = HashMap::from([("姓名".to_string(), "Nobody".to_string())]);
        assert!(build_bindings(&sources, &row).is_empty());
    }
}
