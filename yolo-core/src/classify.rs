//! Whole-frame image classification on the same preprocessing and locking model as
//! [`Detector`](crate::Detector).

use std::{path::Path, sync::Mutex, time::Duration};

use anyhow::Result;
use image::DynamicImage;
use log::debug;
use serde::Serialize;
use yolo_utils::{gpu::GpuContextOptions, telemetry::timing_guard};

use crate::detector::{Engine, check_runner_input, ensure_frame, lock_engine, resolve_labels};
use crate::error::{DetectError, DetectResult};
use crate::labels::LabelSet;
use crate::model::{ModelRunner, OnnxModel};
use crate::preprocess::{PreprocessConfig, Preprocessor, select_preprocessor};

/// Number of ranked classes reported by default.
pub const DEFAULT_TOP_K: usize = 5;

/// One scored class.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub class_id: usize,
    pub confidence: f32,
    pub class_name: String,
}

/// Best class plus the ranked top-k list (best first).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationResult {
    pub best: Classification,
    pub top: Vec<Classification>,
}

#[derive(Debug, Clone)]
pub struct ClassifierOptions {
    pub preprocess: PreprocessConfig,
    pub top_k: usize,
    pub gpu: GpuContextOptions,
    pub labels: Option<LabelSet>,
}

impl Default for ClassifierOptions {
    fn default() -> Self {
        Self {
            // Classification heads are commonly trained at 224x224.
            preprocess: PreprocessConfig {
                model_width: 224,
                model_height: 224,
                ..PreprocessConfig::default()
            },
            top_k: DEFAULT_TOP_K,
            gpu: GpuContextOptions::default(),
            labels: None,
        }
    }
}

/// Thread-safe single-label classifier.
pub struct Classifier {
    engine: Mutex<Engine>,
    preprocess: PreprocessConfig,
    num_classes: usize,
    top_k: usize,
    labels: LabelSet,
}

impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classifier")
            .field("num_classes", &self.num_classes)
            .field("top_k", &self.top_k)
            .finish()
    }
}

impl Classifier {
    pub fn load<P: AsRef<Path>>(
        model_path: P,
        use_accelerator: bool,
        options: ClassifierOptions,
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
        score_count(model.output_dims()).map_err(|source| DetectError::ModelLoad {
            path: path.to_path_buf(),
            source,
        })?;

        let gpu = if use_accelerator {
            options.gpu.clone()
        } else {
            GpuContextOptions::disabled()
        };
        let (preprocessor, _) = select_preprocessor(&gpu);
        Self::with_runner(Box::new(model), preprocessor, options)
    }

    pub fn with_runner(
        runner: Box<dyn ModelRunner>,
        preprocessor: Box<dyn Preprocessor>,
        options: ClassifierOptions,
    ) -> DetectResult<Self> {
        check_runner_input(runner.as_ref(), &options.preprocess)?;
        if options.top_k == 0 {
            return Err(DetectError::invalid("top_k must be at least 1"));
        }
        let num_classes = score_count(runner.output_dims())
            .map_err(|err| DetectError::invalid(format!("{err:#}")))?;
        let labels = resolve_labels(options.labels, runner.as_ref());
        debug!("classifier ready: {num_classes} classes");

        Ok(Self {
            engine: Mutex::new(Engine::new(runner, preprocessor)),
            preprocess: options.preprocess,
            num_classes,
            top_k: options.top_k,
            labels,
        })
    }

    /// Score `frame` and return the best class and the top-k ranking.
    ///
    /// Non-finite scores are ignored; a frame where every score is non-finite is an
    /// inference error.
    pub fn classify(&self, frame: &DynamicImage) -> DetectResult<ClassificationResult> {
        let _guard = timing_guard("yolo_core::classify", log::Level::Debug);
        ensure_frame(frame)?;
        let scores = {
            let mut engine = lock_engine(&self.engine);
            self.scores(&mut engine, frame).map_err(DetectError::Inference)?
        };

        let top: Vec<Classification> = rank(&scores, self.top_k)
            .into_iter()
            .map(|(class_id, confidence)| Classification {
                class_id,
                confidence,
                class_name: self.labels.name(class_id).to_owned(),
            })
            .collect();
        let best = top
            .first()
            .cloned()
            .ok_or_else(|| DetectError::Inference(anyhow::anyhow!("model produced no finite scores")))?;
        Ok(ClassificationResult { best, top })
    }

    fn scores(&self, engine: &mut Engine, frame: &DynamicImage) -> Result<Vec<f32>> {
        let (output, _) = engine.infer(frame, &self.preprocess)?;
        let output = output
            .cast_to::<f32>()
            .map_err(|e| anyhow::anyhow!("model output is not numeric: {e}"))?;
        let data = output
            .as_slice::<f32>()
            .map_err(|e| anyhow::anyhow!("model output is not contiguous: {e}"))?;
        anyhow::ensure!(
            data.len() == self.num_classes,
            "classifier produced {} scores, expected {}",
            data.len(),
            self.num_classes
        );
        Ok(data.to_vec())
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn last_inference_time(&self) -> Option<Duration> {
        lock_engine(&self.engine).last_inference()
    }

    pub fn release(&self) {
        lock_engine(&self.engine).release();
    }
}

/// Number of class scores in a `[1, C]` or `[C]` output.
fn score_count(dims: &[usize]) -> Result<usize> {
    match dims {
        [1, classes] | [classes] if *classes > 0 => Ok(*classes),
        other => anyhow::bail!("classifier output must have shape [1, C] or [C] (got {other:?})"),
    }
}

/// Indices of the `k` highest finite scores, best first; ties keep the lower index.
fn rank(scores: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut ranked: Vec<(usize, f32)> = scores
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, score)| score.is_finite())
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.truncate(k);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::CpuPreprocessor;
    use tract_onnx::prelude::Tensor;

    struct ScoreRunner {
        scores: Vec<f32>,
        dims: [usize; 2],
    }

    impl ModelRunner for ScoreRunner {
        fn input_shape(&self) -> [usize; 4] {
            [1, 3, 224, 224]
        }

        fn output_dims(&self) -> &[usize] {
            &self.dims
        }

        fn run(&self, _input: Tensor) -> Result<Tensor> {
            Tensor::from_shape(&self.dims, &self.scores).map_err(|e| anyhow::anyhow!("{e}"))
        }
    }

    fn classifier(scores: Vec<f32>) -> Classifier {
        let dims = [1, scores.len()];
        Classifier::with_runner(
            Box::new(ScoreRunner { scores, dims }),
            Box::new(CpuPreprocessor),
            ClassifierOptions {
                labels: Some(LabelSet::from_text("a\nb\nc\nd\ne\nf\ng\n")),
                ..ClassifierOptions::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn ranks_top_five() {
        let classifier = classifier(vec![0.1, 0.5, 0.05, 0.2, 0.9, 0.3, 0.0]);
        let frame = DynamicImage::ImageRgb8(image::RgbImage::new(50, 30));
        let result = classifier.classify(&frame).unwrap();

        assert_eq!(result.best.class_id, 4);
        assert_eq!(result.best.class_name, "e");
        let ids: Vec<usize> = result.top.iter().map(|c| c.class_id).collect();
        assert_eq!(ids, vec![4, 1, 5, 3, 0]);
    }

    #[test]
    fn ties_and_non_finite_scores() {
        assert_eq!(rank(&[0.5, f32::NAN, 0.5, 0.1], 2), vec![(0, 0.5), (2, 0.5)]);
        assert!(rank(&[f32::NAN], 5).is_empty());
    }

    #[test]
    fn all_nan_scores_fail() {
        let classifier = classifier(vec![f32::NAN; 3]);
        let frame = DynamicImage::ImageRgb8(image::RgbImage::new(8, 8));
        assert!(matches!(classifier.classify(&frame), Err(DetectError::Inference(_))));
    }

    #[test]
    fn output_shape_must_be_a_vector() {
        assert_eq!(score_count(&[1, 1000]).unwrap(), 1000);
        assert_eq!(score_count(&[10]).unwrap(), 10);
        assert!(score_count(&[1, 84, 8400]).is_err());
        assert!(score_count(&[1, 0]).is_err());
    }
}
