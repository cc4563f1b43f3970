//! Core YOLO detection pipeline.
//!
//! This crate letterboxes frames into model tensors, runs ONNX detectors with
//! `tract-onnx`, decodes dense-grid and flat box-list outputs, applies class-scoped NMS,
//! and maps boxes back into frame coordinates.

/// Whole-frame classification with top-k ranking.
pub mod classify;
/// Output layout detection and candidate decoding.
pub mod decode;
/// High-level thread-safe detector.
pub mod detector;
/// Debug annotation of detections.
pub mod draw;
/// Public error taxonomy.
pub mod error;
/// Class-name tables.
pub mod labels;
/// Aspect-preserving resize and padding geometry.
pub mod letterbox;
/// Model-space to frame-space coordinate mapping.
pub mod mapping;
/// ONNX model loading and execution.
pub mod model;
/// Detection post-processing (IoU, NMS).
pub mod postprocess;
/// Image pre-processing (letterbox, tensor conversion).
pub mod preprocess;

pub use classify::{Classification, ClassificationResult, Classifier, ClassifierOptions};
pub use decode::{DecodeOptions, OutputLayout, OutputShape, decode_output};
pub use detector::{Detection, Detector, DetectorOptions};
pub use error::{DetectError, DetectResult};
pub use labels::LabelSet;
pub use letterbox::{LetterboxParams, PaddingMode};
pub use mapping::{Region, map_to_frame, map_to_frame_with_offset};
pub use model::{ModelRunner, OnnxModel};
pub use postprocess::{BoundingBox, Candidate, ThresholdConfig, apply_nms, non_max_suppression};
pub use preprocess::{
    CpuPreprocessor, ImageTile, PreprocessBackend, PreprocessConfig, PreprocessOutput,
    Preprocessor, WgpuPreprocessor, select_preprocessor, slice_image,
};

/// Returns the crate version for diagnostics.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
