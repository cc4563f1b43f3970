//! Command-line argument definitions for yolo-detect.

use std::path::PathBuf;

use clap::{ArgAction, Parser};
use log::LevelFilter;
use yolo_core::Region;
use yolo_utils::config::{AppSettings, BoxUnits, TensorLayout};

/// Run letterboxed YOLO object detection over images or directories.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct DetectArgs {
    /// Path to an image file or a directory containing images.
    #[arg(short, long)]
    pub input: PathBuf,

    /// Path to the ONNX detector (defaults to the settings file, then models/yolov8n.onnx).
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// Class names: a text file with one label per line, or JSON metadata.
    #[arg(short, long)]
    pub labels: Option<PathBuf>,

    /// Optional settings JSON (defaults to built-in parameters).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the model input width (pixels).
    #[arg(long)]
    pub width: Option<u32>,

    /// Override the model input height (pixels).
    #[arg(long)]
    pub height: Option<u32>,

    /// Override the input tensor layout (nchw, nhwc).
    #[arg(long, value_name = "LAYOUT")]
    pub layout: Option<TensorLayout>,

    /// Override the box coordinate units emitted by the model (pixels, normalized).
    #[arg(long, value_name = "UNITS")]
    pub box_units: Option<BoxUnits>,

    /// Override the confidence threshold.
    #[arg(long)]
    pub confidence: Option<f32>,

    /// Override the NMS IoU threshold.
    #[arg(long)]
    pub iou: Option<f32>,

    /// Override the per-image detection cap (0 = unlimited).
    #[arg(long)]
    pub max_detections: Option<usize>,

    /// Only detect inside this rectangle, given as x,y,width,height.
    #[arg(long, value_name = "X,Y,W,H", conflicts_with = "tiled")]
    pub region: Option<Region>,

    /// Cut large frames into model-sized tiles and detect in each.
    #[arg(long, action = ArgAction::SetTrue)]
    pub tiled: bool,

    /// Disable GPU preprocessing.
    #[arg(long, action = ArgAction::SetTrue)]
    pub no_gpu: bool,

    /// Write detections to a JSON file instead of stdout.
    #[arg(long)]
    pub json: Option<PathBuf>,

    /// Directory to write annotated images with bounding boxes overlaid.
    #[arg(long)]
    pub annotate: Option<PathBuf>,

    /// Enable telemetry timing logs (defaults to settings file).
    #[arg(long, action = ArgAction::SetTrue)]
    pub telemetry: bool,

    /// Override telemetry logging level (error, warn, info, debug, trace).
    #[arg(long, value_name = "LEVEL")]
    pub telemetry_level: Option<LevelFilter>,
}

impl DetectArgs {
    /// Fold command-line overrides into loaded settings.
    pub fn apply_overrides(&self, settings: &mut AppSettings) {
        if let Some(model) = &self.model {
            settings.model_path = Some(model.display().to_string());
        }
        if let Some(labels) = &self.labels {
            settings.labels_path = Some(labels.display().to_string());
        }
        if let Some(width) = self.width {
            settings.input.width = width;
        }
        if let Some(height) = self.height {
            settings.input.height = height;
        }
        if let Some(layout) = self.layout {
            settings.input.layout = layout;
        }
        if let Some(units) = self.box_units {
            settings.detection.box_units = units;
        }
        if let Some(confidence) = self.confidence {
            settings.detection.confidence = confidence;
        }
        if let Some(iou) = self.iou {
            settings.detection.iou = iou;
        }
        if let Some(max) = self.max_detections {
            settings.detection.max_detections = max;
        }
        if self.no_gpu {
            settings.gpu.enabled = false;
        }
        if self.telemetry {
            settings.telemetry.enabled = true;
        }
        if let Some(level) = self.telemetry_level {
            settings.telemetry.set_level(level);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_settings() {
        let args = DetectArgs::parse_from([
            "yolo-detect",
            "--input",
            "frames",
            "--model",
            "custom.onnx",
            "--confidence",
            "0.4",
            "--iou",
            "0.5",
            "--layout",
            "nhwc",
            "--box-units",
            "normalized",
            "--no-gpu",
            "--telemetry-level",
            "trace",
        ]);
        let mut settings = AppSettings::default();
        args.apply_overrides(&mut settings);

        assert_eq!(settings.model_path.as_deref(), Some("custom.onnx"));
        assert_eq!(settings.detection.confidence, 0.4);
        assert_eq!(settings.detection.iou, 0.5);
        assert_eq!(settings.input.layout, TensorLayout::Nhwc);
        assert_eq!(settings.detection.box_units, BoxUnits::Normalized);
        assert!(!settings.gpu.enabled);
        assert_eq!(settings.telemetry.level_filter(), LevelFilter::Trace);
    }

    #[test]
    fn parses_region_argument() {
        let args =
            DetectArgs::parse_from(["yolo-detect", "-i", "a.png", "--region", "10,20,300,200"]);
        assert_eq!(args.region, Some(Region::new(10, 20, 300, 200)));

        let conflict =
            DetectArgs::try_parse_from(["yolo-detect", "-i", "a.png", "--region", "0,0,1,1", "--tiled"]);
        assert!(conflict.is_err());
        assert!(DetectArgs::try_parse_from(["yolo-detect", "-i", "a.png", "--region", "1,2"]).is_err());
    }
}
