use std::sync::Arc;

use anyhow::Result;
use image::{DynamicImage, RgbImage};
use tract_onnx::prelude::Tensor;
use yolo_core::{
    BoundingBox, CpuPreprocessor, DetectError, Detector, DetectorOptions, LabelSet, ModelRunner,
    OutputLayout, Region, ThresholdConfig,
};

const CLASSES: usize = 80;
const POSITIONS: usize = 8400;
const OUTPUT_DIMS: [usize; 3] = [1, CLASSES + 4, POSITIONS];

/// A box in `(cx, cy, w, h)` model pixels plus one class score.
#[derive(Clone, Copy)]
struct Peak {
    position: usize,
    center: (f32, f32),
    size: (f32, f32),
    class_id: usize,
    score: f32,
}

/// Dense-grid runner that replays the same channel-major output for every frame.
struct GridRunner {
    output: Arc<Vec<f32>>,
}

impl GridRunner {
    fn new(peaks: &[Peak]) -> Self {
        let mut output = vec![0.0f32; (CLASSES + 4) * POSITIONS];
        for peak in peaks {
            let mut put = |channel: usize, value: f32| {
                output[channel * POSITIONS + peak.position] = value;
            };
            put(0, peak.center.0);
            put(1, peak.center.1);
            put(2, peak.size.0);
            put(3, peak.size.1);
            put(4 + peak.class_id, peak.score);
        }
        Self {
            output: Arc::new(output),
        }
    }
}

impl ModelRunner for GridRunner {
    fn input_shape(&self) -> [usize; 4] {
        [1, 3, 640, 640]
    }

    fn output_dims(&self) -> &[usize] {
        &OUTPUT_DIMS
    }

    fn run(&self, input: Tensor) -> Result<Tensor> {
        anyhow::ensure!(input.shape() == [1, 3, 640, 640], "unexpected input {:?}", input.shape());
        Tensor::from_shape(&OUTPUT_DIMS, &self.output)
            .map_err(|e| anyhow::anyhow!("{e}"))
    }
}

fn detector(peaks: &[Peak]) -> Detector {
    detector_with_thresholds(peaks, ThresholdConfig::default())
}

fn detector_with_thresholds(peaks: &[Peak], thresholds: ThresholdConfig) -> Detector {
    let labels = (0..CLASSES).map(|i| format!("class{i}")).collect();
    let options = DetectorOptions {
        thresholds,
        labels: Some(LabelSet::new(labels)),
        ..DetectorOptions::default()
    };
    Detector::with_runner(
        Box::new(GridRunner::new(peaks)),
        Box::new(CpuPreprocessor),
        options,
    )
    .expect("synthetic detector")
}

fn frame(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::new(width, height))
}

const CENTER_PEAK: Peak = Peak {
    position: 100,
    center: (320.0, 320.0),
    size: (100.0, 50.0),
    class_id: 3,
    score: 0.9,
};

#[test]
fn single_dense_grid_peak_becomes_one_detection() {
    let detector = detector(&[CENTER_PEAK]);
    assert_eq!(detector.output_shape().layout, OutputLayout::DenseGrid);
    assert_eq!(detector.output_shape().num_classes, 80);

    let detections = detector.detect(&frame(640, 640)).expect("detect");
    assert_eq!(detections.len(), 1);
    let detection = &detections[0];
    assert_eq!(detection.class_id, 3);
    assert_eq!(detection.class_name, "class3");
    assert!((detection.confidence - 0.9).abs() < 1e-6);
    assert_eq!(detection.rect, BoundingBox::new(270.0, 295.0, 370.0, 345.0));
}

#[test]
fn overlapping_pair_of_same_class_keeps_the_stronger_box() {
    let strong = Peak {
        position: 10,
        center: (200.0, 200.0),
        size: (100.0, 100.0),
        class_id: 0,
        score: 0.9,
    };
    // 100x90 box sharing the top edge: IoU = 9000 / 10000 = 0.9.
    let weak = Peak {
        position: 11,
        center: (200.0, 195.0),
        size: (100.0, 90.0),
        score: 0.8,
        ..strong
    };
    let detections = detector(&[strong, weak]).detect(&frame(640, 640)).unwrap();
    assert_eq!(detections.len(), 1);
    assert!((detections[0].confidence - 0.9).abs() < 1e-6);

    let other_class = Peak {
        class_id: 1,
        ..weak
    };
    let detections = detector(&[strong, other_class])
        .detect(&frame(640, 640))
        .unwrap();
    assert_eq!(detections.len(), 2, "NMS is scoped per class");
}

#[test]
fn detections_stay_inside_the_frame() {
    let edge = Peak {
        position: 5,
        center: (630.0, 40.0),
        size: (60.0, 120.0),
        class_id: 2,
        score: 0.7,
    };
    let detections = detector(&[edge]).detect(&frame(800, 600)).unwrap();
    assert_eq!(detections.len(), 1);
    let rect = detections[0].rect;
    assert!(rect.left >= 0.0 && rect.top >= 0.0);
    assert!(rect.right <= 800.0 && rect.bottom <= 600.0);
}

#[test]
fn region_detections_are_offset_into_frame_space() {
    let detector = detector(&[CENTER_PEAK]);
    let detections = detector
        .detect_region(&frame(1280, 720), Region::new(640, 360, 640, 360))
        .unwrap();
    assert_eq!(detections.len(), 1);
    // Crop 640x360 letterboxes with pad_y = 140 at scale 1.
    assert_eq!(detections[0].rect, BoundingBox::new(910.0, 515.0, 1010.0, 565.0));
}

#[test]
fn region_outside_the_frame_is_invalid() {
    let detector = detector(&[CENTER_PEAK]);
    let err = detector
        .detect_region(&frame(640, 480), Region::new(700, 0, 50, 50))
        .unwrap_err();
    assert!(matches!(err, DetectError::InvalidArgument(_)));

    let err = detector
        .detect_region(&frame(640, 480), Region::new(10, 10, 0, 20))
        .unwrap_err();
    assert!(matches!(err, DetectError::InvalidArgument(_)));
}

#[test]
fn tiled_detection_reports_each_tile() {
    let detector = detector(&[CENTER_PEAK]);
    let mut detections = detector.detect_tiled(&frame(1280, 640)).unwrap();
    detections.sort_by(|a, b| a.rect.left.total_cmp(&b.rect.left));
    assert_eq!(detections.len(), 2);
    assert_eq!(detections[0].rect, BoundingBox::new(270.0, 295.0, 370.0, 345.0));
    assert_eq!(detections[1].rect, BoundingBox::new(910.0, 295.0, 1010.0, 345.0));
}

#[test]
fn thresholds_validate_and_reset() {
    let detector = detector(&[CENTER_PEAK]);
    for (confidence, iou) in [(Some(-0.1), None), (None, Some(1.01)), (Some(f32::NAN), None)] {
        assert!(matches!(
            detector.set_thresholds(confidence, iou),
            Err(DetectError::InvalidArgument(_))
        ));
    }
    assert_eq!(detector.thresholds(), ThresholdConfig::default());

    detector.set_thresholds(Some(0.95), Some(0.3)).unwrap();
    assert_eq!(
        detector.thresholds(),
        ThresholdConfig {
            confidence: 0.95,
            iou: 0.3
        }
    );
    assert!(detector.detect(&frame(640, 640)).unwrap().is_empty());

    detector.reset_thresholds();
    assert_eq!(detector.thresholds(), ThresholdConfig::default());
    assert_eq!(detector.detect(&frame(640, 640)).unwrap().len(), 1);
}

#[test]
fn reset_returns_to_default_thresholds_after_custom_construction() {
    let faint = Peak {
        score: 0.3,
        ..CENTER_PEAK
    };
    let detector = detector_with_thresholds(
        &[faint],
        ThresholdConfig {
            confidence: 0.4,
            iou: 0.5,
        },
    );
    assert!(detector.detect(&frame(640, 640)).unwrap().is_empty());

    detector.set_thresholds(Some(0.5), None).unwrap();
    detector.reset_thresholds();
    assert_eq!(
        detector.thresholds(),
        ThresholdConfig {
            confidence: 0.25,
            iou: 0.7
        }
    );
    assert_eq!(detector.detect(&frame(640, 640)).unwrap().len(), 1);
}

#[test]
fn detector_is_shareable_across_threads() {
    let detector = Arc::new(detector(&[CENTER_PEAK]));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let detector = Arc::clone(&detector);
            std::thread::spawn(move || detector.detect(&frame(640, 640)).map(|d| d.len()))
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().expect("thread").unwrap(), 1);
    }
}

#[test]
fn drawing_does_not_touch_the_source() {
    let detector = detector(&[CENTER_PEAK]);
    let source = frame(640, 640);
    let detections = detector.detect(&source).unwrap();
    let annotated = detector.draw_boxes(&source, &detections).to_rgba8();
    assert_eq!(annotated.get_pixel(270, 320).0, [255, 0, 0, 255]);
    assert_eq!(source.to_rgba8().get_pixel(270, 320).0, [0, 0, 0, 255]);
}
