//! The detection facade: one model, one preprocessing backend, one lock.

use std::{
    path::Path,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView};
use log::{debug, warn};
use serde::Serialize;
use tract_onnx::prelude::Tensor;
use yolo_utils::{
    config::{AppSettings, BoxUnits},
    gpu::GpuContextOptions,
    pool::ScratchBuffers,
    telemetry::timing_guard,
};

use crate::decode::{DecodeOptions, OutputShape, decode_output};
use crate::draw::draw_detections;
use crate::error::{DetectError, DetectResult};
use crate::labels::LabelSet;
use crate::letterbox::LetterboxParams;
use crate::mapping::{Region, map_to_frame_with_offset};
use crate::model::{ModelRunner, OnnxModel};
use crate::postprocess::{BoundingBox, Candidate, ThresholdConfig, apply_nms, check_unit_interval};
use crate::preprocess::{
    PreprocessBackend, PreprocessConfig, Preprocessor, select_preprocessor, slice_image,
};

/// A detection in original-frame pixels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub rect: BoundingBox,
    pub confidence: f32,
    pub class_id: usize,
    pub class_name: String,
}

/// Construction-time settings for a [`Detector`].
#[derive(Debug, Clone)]
pub struct DetectorOptions {
    pub preprocess: PreprocessConfig,
    /// Thresholds installed at construction and restored by [`Detector::reset_thresholds`].
    pub thresholds: ThresholdConfig,
    pub box_units: BoxUnits,
    /// Cap on detections per frame after NMS; `0` keeps all of them.
    pub max_detections: usize,
    /// GPU preferences used when the accelerator is requested.
    pub gpu: GpuContextOptions,
    /// Class names. When `None`, names embedded in the model are used if present.
    pub labels: Option<LabelSet>,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            preprocess: PreprocessConfig::default(),
            thresholds: ThresholdConfig::default(),
            box_units: BoxUnits::Pixels,
            max_detections: 0,
            gpu: GpuContextOptions::default(),
            labels: None,
        }
    }
}

impl DetectorOptions {
    /// Build options from persisted settings, reading the label file when one is set.
    pub fn from_settings(settings: &AppSettings) -> Result<Self> {
        let labels = settings
            .labels_path
            .as_deref()
            .map(LabelSet::from_path)
            .transpose()?;
        Ok(Self {
            preprocess: PreprocessConfig::from(settings),
            thresholds: ThresholdConfig::from(&settings.detection),
            box_units: settings.detection.box_units,
            max_detections: settings.detection.max_detections,
            gpu: GpuContextOptions::from(&settings.gpu),
            labels,
        })
    }
}

/// Everything a frame needs exclusive access to.
pub(crate) struct Engine {
    runner: Box<dyn ModelRunner>,
    preprocessor: Box<dyn Preprocessor>,
    scratch: ScratchBuffers,
    last_inference: Option<Duration>,
}

impl Engine {
    pub(crate) fn new(runner: Box<dyn ModelRunner>, preprocessor: Box<dyn Preprocessor>) -> Self {
        Self {
            runner,
            preprocessor,
            scratch: ScratchBuffers::default(),
            last_inference: None,
        }
    }

    /// Letterbox `frame` and run the model once, recording how long inference took.
    pub(crate) fn infer(
        &mut self,
        frame: &DynamicImage,
        config: &PreprocessConfig,
    ) -> Result<(Tensor, LetterboxParams)> {
        let prepared = {
            let _guard = timing_guard("yolo_core::preprocess", log::Level::Debug);
            self.preprocessor
                .preprocess(frame, config, &mut self.scratch)
                .context("preprocessing failed")?
        };

        let started = Instant::now();
        let output = {
            let _guard = timing_guard("yolo_core::inference", log::Level::Debug);
            self.runner.run(prepared.tensor)?
        };
        self.last_inference = Some(started.elapsed());
        Ok((output, prepared.letterbox))
    }

    pub(crate) fn last_inference(&self) -> Option<Duration> {
        self.last_inference
    }

    pub(crate) fn release(&mut self) {
        self.scratch.clear();
    }
}

pub(crate) fn lock_engine(engine: &Mutex<Engine>) -> MutexGuard<'_, Engine> {
    engine.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn ensure_frame(frame: &DynamicImage) -> DetectResult<(u32, u32)> {
    let (width, height) = frame.dimensions();
    if width == 0 || height == 0 {
        return Err(DetectError::invalid(format!(
            "frame dimensions must be greater than zero (got {width}x{height})"
        )));
    }
    Ok((width, height))
}

pub(crate) fn resolve_labels(explicit: Option<LabelSet>, runner: &dyn ModelRunner) -> LabelSet {
    if let Some(labels) = explicit {
        return labels;
    }
    match runner.embedded_labels().map(LabelSet::from_metadata) {
        Some(Ok(labels)) => {
            debug!("using {} class names embedded in the model", labels.len());
            labels
        }
        Some(Err(err)) => {
            warn!("ignoring unreadable class names in model metadata: {err:#}");
            LabelSet::default()
        }
        None => LabelSet::default(),
    }
}

pub(crate) fn check_runner_input(
    runner: &dyn ModelRunner,
    config: &PreprocessConfig,
) -> DetectResult<()> {
    config
        .validate()
        .map_err(|err| DetectError::invalid(format!("{err:#}")))?;
    let expected = config.tensor_shape();
    let actual = runner.input_shape();
    if actual != expected {
        return Err(DetectError::invalid(format!(
            "model input {actual:?} does not match preprocessing shape {expected:?}"
        )));
    }
    Ok(())
}

/// Thread-safe YOLO detector.
///
/// Frames are processed one at a time: a single mutex guards the model runner, the
/// preprocessing backend, and the scratch pools for the whole
/// preprocess → inference → decode → NMS sequence. Thresholds live outside the lock
/// and are snapshotted once at the start of every call.
pub struct Detector {
    engine: Mutex<Engine>,
    confidence_bits: AtomicU32,
    iou_bits: AtomicU32,
    preprocess: PreprocessConfig,
    decode: DecodeOptions,
    max_detections: usize,
    output_shape: OutputShape,
    backend: PreprocessBackend,
    labels: LabelSet,
}

impl std::fmt::Debug for Detector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Detector")
            .field("output_shape", &self.output_shape)
            .field("backend", &self.backend)
            .field("thresholds", &self.thresholds())
            .field("labels", &self.labels.len())
            .finish()
    }
}

impl Detector {
    /// Load an ONNX detector.
    ///
    /// # Arguments
    ///
    /// * `model_path` - The path to the ONNX model file.
    /// * `use_accelerator` - Request the GPU preprocessing backend; CPU is used when no
    ///   adapter is available.
    /// * `options` - Preprocessing, threshold, and label settings.
    pub fn load<P: AsRef<Path>>(
        model_path: P,
        use_accelerator: bool,
        options: DetectorOptions,
    ) -> DetectResult<Self> {
        let path = model_path.as_ref();
        options
            .preprocess
            .validate()
            .map_err(|err| DetectError::invalid(format!("{err:#}")))?;

        let model = OnnxModel::load(path, &options.preprocess).map_err(|source| {
            DetectError::ModelLoad {
                path: path.to_path_buf(),
                source,
            }
        })?;
        OutputShape::from_dims(model.output_dims()).map_err(|source| DetectError::ModelLoad {
            path: path.to_path_buf(),
            source,
        })?;

        let gpu = if use_accelerator {
            options.gpu.clone()
        } else {
            GpuContextOptions::disabled()
        };
        let (preprocessor, availability) = select_preprocessor(&gpu);
        debug!("detector {}: GPU {}", path.display(), availability.describe());

        Self::with_runner(Box::new(model), preprocessor, options)
    }

    /// Assemble a detector from an arbitrary runner and preprocessing backend.
    ///
    /// Fails with [`DetectError::InvalidArgument`] when the runner's input does not match
    /// the preprocessing shape, its output is not a recognised layout, or the thresholds
    /// are out of range.
    pub fn with_runner(
        runner: Box<dyn ModelRunner>,
        preprocessor: Box<dyn Preprocessor>,
        options: DetectorOptions,
    ) -> DetectResult<Self> {
        check_runner_input(runner.as_ref(), &options.preprocess)?;
        options.thresholds.validate().map_err(DetectError::InvalidArgument)?;
        let output_shape = OutputShape::from_dims(runner.output_dims())
            .map_err(|err| DetectError::invalid(format!("{err:#}")))?;

        let labels = resolve_labels(options.labels, runner.as_ref());
        if !labels.is_empty()
            && output_shape.num_classes > 0
            && labels.len() != output_shape.num_classes
        {
            warn!(
                "label count ({}) differs from model classes ({})",
                labels.len(),
                output_shape.num_classes
            );
        }

        let backend = preprocessor.backend();
        debug!("detector ready: {output_shape}, {backend:?} preprocessing");
        Ok(Self {
            engine: Mutex::new(Engine::new(runner, preprocessor)),
            confidence_bits: AtomicU32::new(options.thresholds.confidence.to_bits()),
            iou_bits: AtomicU32::new(options.thresholds.iou.to_bits()),
            decode: DecodeOptions {
                box_units: options.box_units,
                model_width: options.preprocess.model_width,
                model_height: options.preprocess.model_height,
            },
            preprocess: options.preprocess,
            max_detections: options.max_detections,
            output_shape,
            backend,
            labels,
        })
    }

    /// Detect objects in the whole frame.
    pub fn detect(&self, frame: &DynamicImage) -> DetectResult<Vec<Detection>> {
        let _guard = timing_guard("yolo_core::detect", log::Level::Debug);
        ensure_frame(frame)?;
        let thresholds = self.thresholds();

        let mut engine = lock_engine(&self.engine);
        let candidates = self
            .run_frame(&mut engine, frame, (0, 0), &thresholds)
            .map_err(DetectError::Inference)?;
        Ok(self.label(candidates))
    }

    /// Detect objects inside `region`, reporting boxes in full-frame coordinates.
    ///
    /// The region is clamped to the frame first; a region with no overlap is an
    /// [`DetectError::InvalidArgument`].
    pub fn detect_region(
        &self,
        frame: &DynamicImage,
        region: Region,
    ) -> DetectResult<Vec<Detection>> {
        let _guard = timing_guard("yolo_core::detect_region", log::Level::Debug);
        let (width, height) = ensure_frame(frame)?;
        let clamped = region.clamp_to(width, height).ok_or_else(|| {
            DetectError::invalid(format!(
                "region {region} does not overlap the {width}x{height} frame"
            ))
        })?;
        let crop = frame.crop_imm(clamped.x as u32, clamped.y as u32, clamped.width, clamped.height);
        let thresholds = self.thresholds();

        let mut engine = lock_engine(&self.engine);
        let candidates = self
            .run_frame(&mut engine, &crop, clamped.origin(), &thresholds)
            .map_err(DetectError::Inference)?;
        Ok(self.label(candidates))
    }

    /// Cut the frame into model-sized tiles, detect in each, and merge the results.
    ///
    /// Boxes from neighbouring tiles are merged with the same class-scoped NMS used per
    /// frame, so an object straddling a seam is reported once when its halves overlap
    /// enough.
    pub fn detect_tiled(&self, frame: &DynamicImage) -> DetectResult<Vec<Detection>> {
        let _guard = timing_guard("yolo_core::detect_tiled", log::Level::Debug);
        ensure_frame(frame)?;
        let tiles = slice_image(frame, self.preprocess.model_width, self.preprocess.model_height)
            .map_err(|err| DetectError::invalid(format!("{err:#}")))?;
        let thresholds = self.thresholds();

        let mut merged = Vec::new();
        {
            let mut engine = lock_engine(&self.engine);
            for tile in &tiles {
                let candidates = self
                    .run_frame(&mut engine, &tile.image, tile.region.origin(), &thresholds)
                    .with_context(|| format!("tile {}", tile.region))
                    .map_err(DetectError::Inference)?;
                merged.extend(candidates);
            }
        }
        debug!("{} tiles produced {} candidates", tiles.len(), merged.len());
        Ok(self.label(apply_nms(merged, &thresholds, self.max_detections)))
    }

    /// Preprocess, infer, decode, suppress, and map back into frame space.
    fn run_frame(
        &self,
        engine: &mut Engine,
        frame: &DynamicImage,
        origin: (u32, u32),
        thresholds: &ThresholdConfig,
    ) -> Result<Vec<Candidate>> {
        let (output, letterbox) = engine.infer(frame, &self.preprocess)?;
        let output = output
            .cast_to::<f32>()
            .map_err(|e| anyhow::anyhow!("model output is not numeric: {e}"))?;
        let data = output
            .as_slice::<f32>()
            .map_err(|e| anyhow::anyhow!("model output is not contiguous: {e}"))?;

        let candidates = {
            let _guard = timing_guard("yolo_core::decode", log::Level::Debug);
            decode_output(data, &self.output_shape, thresholds, &self.decode)?
        };
        let kept = {
            let _guard = timing_guard("yolo_core::nms", log::Level::Debug);
            apply_nms(candidates, thresholds, self.max_detections)
        };

        Ok(kept
            .into_iter()
            .map(|candidate| Candidate {
                rect: map_to_frame_with_offset(&candidate.rect, &letterbox, origin),
                ..candidate
            })
            .collect())
    }

    fn label(&self, candidates: Vec<Candidate>) -> Vec<Detection> {
        candidates
            .into_iter()
            .map(|candidate| Detection {
                rect: candidate.rect,
                confidence: candidate.confidence,
                class_id: candidate.class_id,
                class_name: self.labels.name(candidate.class_id).to_owned(),
            })
            .collect()
    }

    /// Update either threshold. Values must lie in `[0, 1]`; on error neither changes.
    pub fn set_thresholds(&self, confidence: Option<f32>, iou: Option<f32>) -> DetectResult<()> {
        if let Some(value) = confidence {
            check_unit_interval("confidence", value).map_err(DetectError::InvalidArgument)?;
        }
        if let Some(value) = iou {
            check_unit_interval("iou", value).map_err(DetectError::InvalidArgument)?;
        }
        if let Some(value) = confidence {
            self.confidence_bits.store(value.to_bits(), Ordering::Relaxed);
        }
        if let Some(value) = iou {
            self.iou_bits.store(value.to_bits(), Ordering::Relaxed);
        }
        Ok(())
    }

    /// Restore the default thresholds (confidence 0.25, IoU 0.7), regardless of the
    /// values the detector was built with.
    pub fn reset_thresholds(&self) {
        let defaults = ThresholdConfig::default();
        self.confidence_bits
            .store(defaults.confidence.to_bits(), Ordering::Relaxed);
        self.iou_bits.store(defaults.iou.to_bits(), Ordering::Relaxed);
    }

    pub fn thresholds(&self) -> ThresholdConfig {
        ThresholdConfig {
            confidence: f32::from_bits(self.confidence_bits.load(Ordering::Relaxed)),
            iou: f32::from_bits(self.iou_bits.load(Ordering::Relaxed)),
        }
    }

    /// Copy of `frame` with every detection outlined.
    pub fn draw_boxes(&self, frame: &DynamicImage, detections: &[Detection]) -> DynamicImage {
        draw_detections(frame, detections)
    }

    /// Duration of the most recent model run, `None` before the first frame.
    pub fn last_inference_time(&self) -> Option<Duration> {
        lock_engine(&self.engine).last_inference()
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn output_shape(&self) -> OutputShape {
        self.output_shape
    }

    pub fn preprocess_config(&self) -> &PreprocessConfig {
        &self.preprocess
    }

    pub fn backend(&self) -> PreprocessBackend {
        self.backend
    }

    /// Drop pooled scratch buffers. The detector stays usable.
    pub fn release(&self) {
        lock_engine(&self.engine).release();
    }
}
