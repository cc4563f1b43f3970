//! Writing annotated copies of processed images.

use std::{
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use image::DynamicImage;
use yolo_core::{Detection, Detector};

/// Outline `detections` on `frame` and save the result under `output_dir` using the
/// source file name.
pub fn annotate_image(
    detector: &Detector,
    image_path: &Path,
    frame: &DynamicImage,
    detections: &[Detection],
    output_dir: &Path,
) -> Result<PathBuf> {
    let annotated = detector.draw_boxes(frame, detections);

    let file_name = image_path
        .file_name()
        .unwrap_or_else(|| OsStr::new("frame.png"));
    let output_path = output_dir.join(file_name);

    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    // JPEG has no alpha channel.
    let to_save = match output_path.extension().and_then(OsStr::to_str) {
        Some(ext) if ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg") => {
            DynamicImage::ImageRgb8(annotated.to_rgb8())
        }
        _ => annotated,
    };
    to_save
        .save(&output_path)
        .with_context(|| format!("failed to save annotated image {}", output_path.display()))?;

    Ok(output_path)
}
