//! Shared configuration types consumed across the detection workspace.
//!
//! These structures describe model input, normalization, letterboxing, and detection
//! thresholds in a form that can be serialized to disk and reused by the CLI.

use crate::gpu::GpuContextOptions;

use anyhow::{Context, Result};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::{fmt, fs, path::Path, str::FromStr};

/// Detection thresholds applied after decoding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectionSettings {
    /// Minimum confidence for a candidate to be kept.
    pub confidence: f32,
    /// IoU above which a lower-scored box of the same class is suppressed.
    pub iou: f32,
    /// Cap on detections returned per frame after NMS (0 = unlimited).
    pub max_detections: usize,
    /// Coordinate units of the model's box outputs.
    pub box_units: BoxUnits,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            confidence: 0.25,
            iou: 0.7,
            max_detections: 0,
            box_units: BoxUnits::Pixels,
        }
    }
}

/// Units used by the model when emitting box coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum BoxUnits {
    /// Coordinates are model-input pixels.
    #[default]
    Pixels,
    /// Coordinates are fractions of the model input size.
    Normalized,
}

impl FromStr for BoxUnits {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pixels" | "px" => Ok(BoxUnits::Pixels),
            "normalized" | "norm" => Ok(BoxUnits::Normalized),
            other => Err(format!(
                "invalid box units '{other}'; expected 'pixels' or 'normalized'"
            )),
        }
    }
}

/// Memory layout of the model input tensor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TensorLayout {
    /// `[1, 3, H, W]`, the usual ONNX export.
    #[default]
    Nchw,
    /// `[1, H, W, 3]`, as produced by TFLite-style exports.
    Nhwc,
}

impl fmt::Display for TensorLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TensorLayout::Nchw => "nchw",
            TensorLayout::Nhwc => "nhwc",
        })
    }
}

impl FromStr for TensorLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nchw" => Ok(TensorLayout::Nchw),
            "nhwc" => Ok(TensorLayout::Nhwc),
            other => Err(format!(
                "invalid tensor layout '{other}'; expected 'nchw' or 'nhwc'"
            )),
        }
    }
}

/// Model input resolution in pixels plus tensor layout.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InputDimensions {
    pub width: u32,
    pub height: u32,
    pub layout: TensorLayout,
}

impl Default for InputDimensions {
    fn default() -> Self {
        Self {
            width: 640,
            height: 640,
            layout: TensorLayout::Nchw,
        }
    }
}

/// Per-channel normalization applied as `(value - mean) / std`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NormalizationSettings {
    pub mean: f32,
    pub std: f32,
}

impl Default for NormalizationSettings {
    fn default() -> Self {
        Self {
            mean: 0.0,
            std: 255.0,
        }
    }
}

/// Where letterbox padding is placed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaddingStyle {
    /// Split padding evenly between both sides.
    #[default]
    Centered,
    /// Round the leading pad down to a multiple of the stride.
    StrideAligned,
}

/// Letterbox placement preferences.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LetterboxSettings {
    pub padding: PaddingStyle,
    /// Alignment used by [`PaddingStyle::StrideAligned`].
    pub stride: u32,
}

impl Default for LetterboxSettings {
    fn default() -> Self {
        Self {
            padding: PaddingStyle::Centered,
            stride: 32,
        }
    }
}

/// Settings controlling optional runtime telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Whether telemetry timing logs are enabled.
    pub enabled: bool,
    /// Logging level for telemetry output (error, warn, info, debug, trace).
    pub level: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            level: "debug".to_string(),
        }
    }
}

impl TelemetrySettings {
    /// Resolve the configured level string into a `LevelFilter`.
    pub fn level_filter(&self) -> LevelFilter {
        match self.level.trim().to_ascii_lowercase().as_str() {
            "off" => LevelFilter::Off,
            "error" => LevelFilter::Error,
            "warn" | "warning" => LevelFilter::Warn,
            "info" => LevelFilter::Info,
            "trace" => LevelFilter::Trace,
            _ => LevelFilter::Debug,
        }
    }

    pub fn set_level(&mut self, level: LevelFilter) {
        self.level = level.as_str().to_ascii_lowercase();
    }
}

/// GPU runtime preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuSettings {
    /// Attempt the GPU preprocessing backend when an adapter is available.
    pub enabled: bool,
    /// Respect `WGPU_*` environment overrides when initializing the backend.
    pub respect_env: bool,
}

impl Default for GpuSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            respect_env: true,
        }
    }
}

impl From<&GpuSettings> for GpuContextOptions {
    fn from(settings: &GpuSettings) -> Self {
        GpuContextOptions {
            enabled: settings.enabled,
            respect_env: settings.respect_env,
            ..Default::default()
        }
    }
}

/// Persistent settings consumed by the CLI and library callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Path to the ONNX detector. `None` falls back to the default model location.
    pub model_path: Option<String>,
    /// Optional label file (plain text or JSON metadata).
    pub labels_path: Option<String>,
    /// Model input size used when the model does not pin one.
    pub input: InputDimensions,
    pub normalization: NormalizationSettings,
    pub letterbox: LetterboxSettings,
    pub detection: DetectionSettings,
    pub telemetry: TelemetrySettings,
    pub gpu: GpuSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            model_path: Some(DEFAULT_MODEL_PATH.into()),
            labels_path: None,
            input: InputDimensions::default(),
            normalization: NormalizationSettings::default(),
            letterbox: LetterboxSettings::default(),
            detection: DetectionSettings::default(),
            telemetry: TelemetrySettings::default(),
            gpu: GpuSettings::default(),
        }
    }
}

/// Model location used when settings leave `model_path` empty.
pub const DEFAULT_MODEL_PATH: &str = "models/yolov8n.onnx";

impl AppSettings {
    /// Load settings from a JSON file.
    ///
    /// Missing fields take their defaults; a missing `model_path` resolves to
    /// [`DEFAULT_MODEL_PATH`].
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        let mut settings: AppSettings = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse settings JSON at {}", path.display()))?;

        if settings.model_path.is_none() {
            settings.model_path = Some(DEFAULT_MODEL_PATH.into());
        }
        settings.validate()?;
        Ok(settings)
    }

    /// Serialize settings to disk in pretty-printed JSON.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let payload =
            serde_json::to_string_pretty(self).context("failed to serialize settings JSON")?;
        fs::write(path, payload)
            .with_context(|| format!("failed to write settings file {}", path.display()))?;
        Ok(())
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.input.width > 0 && self.input.height > 0,
            "input dimensions must be positive (got {}x{})",
            self.input.width,
            self.input.height
        );
        anyhow::ensure!(
            self.normalization.std.is_finite() && self.normalization.std != 0.0,
            "normalization std must be finite and non-zero"
        );
        anyhow::ensure!(self.letterbox.stride > 0, "letterbox stride must be positive");
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.detection.confidence),
            "confidence threshold must be within [0, 1] (got {})",
            self.detection.confidence
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.detection.iou),
            "IoU threshold must be within [0, 1] (got {})",
            self.detection.iou
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn default_settings_round_trip() {
        let file = NamedTempFile::new().expect("tempfile");
        let mut settings = AppSettings::default();
        settings.labels_path = Some("labels/coco.txt".into());
        settings.letterbox.padding = PaddingStyle::StrideAligned;
        settings.save_to_path(file.path()).expect("save");

        let loaded = AppSettings::load_from_path(file.path()).expect("load");
        assert_eq!(loaded.input, settings.input);
        assert_eq!(loaded.letterbox, settings.letterbox);
        assert_eq!(loaded.detection, settings.detection);
        assert_eq!(loaded.model_path, settings.model_path);
        assert_eq!(loaded.labels_path, settings.labels_path);
        assert_eq!(loaded.normalization, settings.normalization);
        assert_eq!(loaded.gpu.enabled, settings.gpu.enabled);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let file = NamedTempFile::new().expect("tempfile");
        let json = r#"{
            "input": { "width": 320, "layout": "nhwc" },
            "detection": { "confidence": 0.4, "box_units": "normalized" }
        }"#;
        fs::write(file.path(), json).expect("write custom settings");

        let loaded = AppSettings::load_from_path(file.path()).expect("load");
        assert_eq!(loaded.input.width, 320);
        assert_eq!(loaded.input.height, 640);
        assert_eq!(loaded.input.layout, TensorLayout::Nhwc);
        assert_eq!(loaded.detection.confidence, 0.4);
        assert_eq!(loaded.detection.iou, 0.7);
        assert_eq!(loaded.detection.box_units, BoxUnits::Normalized);
        assert_eq!(loaded.model_path.as_deref(), Some(DEFAULT_MODEL_PATH));
        assert_eq!(loaded.normalization.std, 255.0);
        assert!(!loaded.telemetry.enabled);
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        let file = NamedTempFile::new().expect("tempfile");
        fs::write(file.path(), r#"{ "detection": { "iou": 1.5 } }"#).expect("write");
        let err = AppSettings::load_from_path(file.path()).unwrap_err();
        assert!(err.to_string().contains("IoU"));
    }

    #[test]
    fn telemetry_level_parses_variants() {
        let telemetry = TelemetrySettings {
            level: "TRACE".into(),
            ..TelemetrySettings::default()
        };
        assert_eq!(telemetry.level_filter(), LevelFilter::Trace);

        let mut telemetry = TelemetrySettings::default();
        telemetry.set_level(LevelFilter::Info);
        assert_eq!(telemetry.level, "info");
        assert_eq!(telemetry.level_filter(), LevelFilter::Info);
    }

    #[test]
    fn enum_strings_parse() {
        assert_eq!("NHWC".parse::<TensorLayout>(), Ok(TensorLayout::Nhwc));
        assert_eq!("norm".parse::<BoxUnits>(), Ok(BoxUnits::Normalized));
        assert!("planar".parse::<TensorLayout>().is_err());
    }
}
