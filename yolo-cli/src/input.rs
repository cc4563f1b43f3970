//! Input collection.

use std::path::{Path, PathBuf};

use anyhow::Result;
use log::debug;
use walkdir::WalkDir;
use yolo_utils::is_image_path;

/// Collect all image paths from a file or directory, sorted for stable output.
pub fn collect_images(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    if !path.is_dir() {
        anyhow::bail!(
            "input path is neither file nor directory: {}",
            path.display()
        );
    }

    let mut images = Vec::new();
    for entry in WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        if is_image_path(entry.path()) {
            images.push(entry.path().to_path_buf());
        } else {
            debug!("Skipping non-image file {}", entry.path().display());
        }
    }
    images.sort();
    Ok(images)
}
