mod annotate;
mod args;
mod input;

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use serde::Serialize;
use yolo_core::{Detection, Detector, DetectorOptions};
use yolo_utils::{
    config::{AppSettings, DEFAULT_MODEL_PATH},
    configure_telemetry, init_logging, load_image, normalize_path,
};

use crate::annotate::annotate_image;
use crate::args::DetectArgs;
use crate::input::collect_images;

#[derive(Debug, Serialize)]
struct ImageDetections {
    image: String,
    width: u32,
    height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    inference_ms: Option<f64>,
    detections: Vec<Detection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    annotated: Option<String>,
}

fn main() -> Result<()> {
    init_logging(log::LevelFilter::Info)?;
    let args = DetectArgs::parse();

    let input_path = normalize_path(&args.input)?;
    let annotate_dir = if let Some(dir) = args.annotate.as_ref() {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create annotation directory {}", dir.display()))?;
        Some(normalize_path(dir)?)
    } else {
        None
    };

    let mut settings = load_settings(args.config.as_ref())?;
    args.apply_overrides(&mut settings);
    settings.validate()?;
    configure_telemetry(
        settings.telemetry.enabled,
        settings.telemetry.level_filter(),
    );

    let model_path = PathBuf::from(
        settings
            .model_path
            .as_deref()
            .unwrap_or(DEFAULT_MODEL_PATH),
    );
    info!(
        "Loading model from {} at resolution {}x{}",
        model_path.display(),
        settings.input.width,
        settings.input.height
    );
    let options = DetectorOptions::from_settings(&settings)?;
    let detector = Detector::load(&model_path, settings.gpu.enabled, options)?;
    info!(
        "Model output: {} ({:?} preprocessing, {} labels)",
        detector.output_shape(),
        detector.backend(),
        detector.labels().len()
    );

    let images = collect_images(&input_path)?;
    if images.is_empty() {
        anyhow::bail!(
            "no images found at {} (supported extensions: jpg, jpeg, png, bmp)",
            input_path.display()
        );
    }

    info!("Processing {} image(s)...", images.len());
    let mut results = Vec::with_capacity(images.len());
    for image_path in images {
        match process_image(&detector, &image_path, &args, annotate_dir.as_deref()) {
            Ok(record) => {
                info!(
                    "{} -> {} detection(s)",
                    image_path.display(),
                    record.detections.len()
                );
                results.push(record);
            }
            Err(err) => warn!("Failed to process {}: {err:#}", image_path.display()),
        }
    }

    if results.is_empty() {
        anyhow::bail!("all detections failed; cannot produce output");
    }

    if let Some(json_path) = args.json.as_ref() {
        if let Some(dir) = json_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        let file = File::create(json_path)
            .with_context(|| format!("failed to create {}", json_path.display()))?;
        serde_json::to_writer_pretty(file, &results).with_context(|| {
            format!("failed to write detection JSON to {}", json_path.display())
        })?;
        info!("Wrote detections to {}", json_path.display());
    } else {
        let json =
            serde_json::to_string_pretty(&results).context("failed to serialize detections")?;
        println!("{json}");
    }

    Ok(())
}

fn load_settings(config_path: Option<&PathBuf>) -> Result<AppSettings> {
    if let Some(path) = config_path {
        let resolved = normalize_path(path)?;
        AppSettings::load_from_path(&resolved)
    } else {
        Ok(AppSettings::default())
    }
}

fn process_image(
    detector: &Detector,
    image_path: &Path,
    args: &DetectArgs,
    annotate_dir: Option<&Path>,
) -> Result<ImageDetections> {
    let frame = load_image(image_path)?;
    let detections = if let Some(region) = args.region {
        detector.detect_region(&frame, region)?
    } else if args.tiled {
        detector.detect_tiled(&frame)?
    } else {
        detector.detect(&frame)?
    };

    let annotated = match annotate_dir {
        Some(dir) => match annotate_image(detector, image_path, &frame, &detections, dir) {
            Ok(path) => {
                info!("Annotated image saved to {}", path.display());
                Some(path.display().to_string())
            }
            Err(err) => {
                warn!("Failed to annotate {}: {err:#}", image_path.display());
                None
            }
        },
        None => None,
    };

    Ok(ImageDetections {
        image: image_path.display().to_string(),
        width: frame.width(),
        height: frame.height(),
        inference_ms: detector
            .last_inference_time()
            .map(|elapsed| elapsed.as_secs_f64() * 1000.0),
        detections,
        annotated,
    })
}
