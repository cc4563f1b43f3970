//! Candidate filtering and class-scoped non-maximum suppression.

use serde::{Deserialize, Serialize};
use yolo_utils::config::DetectionSettings;

/// Default minimum confidence for a detection to be kept.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
/// Default IoU above which a same-class, lower-scored box is suppressed.
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.7;

/// Axis-aligned box stored as left/top/right/bottom edges.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl BoundingBox {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Build a box from its center point and size.
    pub fn from_center(cx: f32, cy: f32, width: f32, height: f32) -> Self {
        let half_w = width * 0.5;
        let half_h = height * 0.5;
        Self::new(cx - half_w, cy - half_h, cx + half_w, cy + half_h)
    }

    pub fn width(&self) -> f32 {
        (self.right - self.left).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.bottom - self.top).max(0.0)
    }

    /// Area of the box; zero for inverted or empty boxes.
    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Intersection over union with another box.
    ///
    /// Symmetric, `1.0` for identical non-degenerate boxes, `0.0` for disjoint or
    /// degenerate ones.
    pub fn iou(&self, other: &Self) -> f32 {
        let left = self.left.max(other.left);
        let top = self.top.max(other.top);
        let right = self.right.min(other.right);
        let bottom = self.bottom.min(other.bottom);

        let intersection = (right - left).max(0.0) * (bottom - top).max(0.0);
        if intersection <= 0.0 {
            return 0.0;
        }

        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }

    /// Shift every edge by `(dx, dy)`.
    pub fn translate(&self, dx: f32, dy: f32) -> Self {
        Self::new(
            self.left + dx,
            self.top + dy,
            self.right + dx,
            self.bottom + dy,
        )
    }

    /// Scale every edge by `(sx, sy)`.
    pub fn scale(&self, sx: f32, sy: f32) -> Self {
        Self::new(
            self.left * sx,
            self.top * sy,
            self.right * sx,
            self.bottom * sy,
        )
    }
}

/// A decoded, not yet suppressed detection in model-input space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub rect: BoundingBox,
    pub confidence: f32,
    pub class_id: usize,
}

/// Confidence and IoU thresholds used for one detection call.
///
/// The detector stores its live values atomically and hands each call a copy, so a
/// concurrent `set_thresholds` never changes thresholds halfway through a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdConfig {
    pub confidence: f32,
    pub iou: f32,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            confidence: DEFAULT_CONFIDENCE_THRESHOLD,
            iou: DEFAULT_IOU_THRESHOLD,
        }
    }
}

impl ThresholdConfig {
    /// Check that both thresholds are finite and within `[0, 1]`.
    pub fn validate(&self) -> Result<(), String> {
        check_unit_interval("confidence", self.confidence)?;
        check_unit_interval("iou", self.iou)
    }
}

pub(crate) fn check_unit_interval(name: &str, value: f32) -> Result<(), String> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(format!("{name} threshold must be within [0, 1] (got {value})"))
    }
}

impl From<&DetectionSettings> for ThresholdConfig {
    fn from(settings: &DetectionSettings) -> Self {
        Self {
            confidence: settings.confidence,
            iou: settings.iou,
        }
    }
}

/// Class-scoped non-maximum suppression.
///
/// Candidates are stably sorted by descending confidence, then swept once: a candidate
/// is dropped when an already kept candidate of the same class overlaps it with IoU
/// strictly above `iou_threshold`. Equal-confidence candidates keep their input order.
pub fn non_max_suppression(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let suppressed = kept.iter().any(|existing| {
            existing.class_id == candidate.class_id
                && existing.rect.iou(&candidate.rect) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

/// Run NMS and cap the survivors at `max_detections` (0 = unlimited).
pub fn apply_nms(
    candidates: Vec<Candidate>,
    thresholds: &ThresholdConfig,
    max_detections: usize,
) -> Vec<Candidate> {
    let mut kept = non_max_suppression(candidates, thresholds.iou);
    if max_detections > 0 && kept.len() > max_detections {
        kept.truncate(max_detections);
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(rect: BoundingBox, confidence: f32, class_id: usize) -> Candidate {
        Candidate {
            rect,
            confidence,
            class_id,
        }
    }

    #[test]
    fn iou_is_symmetric_and_bounded() {
        let boxes = [
            BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            BoundingBox::new(5.0, 5.0, 15.0, 15.0),
            BoundingBox::new(20.0, 20.0, 30.0, 30.0),
            BoundingBox::new(2.0, 2.0, 2.0, 8.0),
        ];
        for a in &boxes {
            for b in &boxes {
                let forward = a.iou(b);
                assert_eq!(forward, b.iou(a));
                assert!((0.0..=1.0).contains(&forward));
            }
        }
        assert_eq!(boxes[0].iou(&boxes[0]), 1.0);
        assert_eq!(boxes[0].iou(&boxes[2]), 0.0);
        assert_eq!(boxes[3].iou(&boxes[3]), 0.0, "degenerate boxes never overlap");
        assert!((boxes[0].iou(&boxes[1]) - 25.0 / 175.0).abs() < 1e-6);
    }

    #[test]
    fn suppresses_same_class_overlap_only() {
        let a = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
        let b = BoundingBox::new(0.0, 0.0, 100.0, 90.0);
        assert!(a.iou(&b) > 0.85);

        let kept = non_max_suppression(
            vec![candidate(a, 0.8, 1), candidate(b, 0.9, 1), candidate(a, 0.5, 2)],
            0.7,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[0].class_id, 1);
        assert_eq!(kept[1].class_id, 2);
    }

    #[test]
    fn output_has_no_surviving_pair_above_threshold() {
        let mut candidates = Vec::new();
        for i in 0..40 {
            let offset = (i % 8) as f32 * 3.0;
            let rect = BoundingBox::new(offset, offset, offset + 50.0, offset + 40.0);
            candidates.push(candidate(rect, 0.3 + (i as f32) * 0.01, i % 3));
        }
        let input = candidates.clone();
        let threshold = 0.5;
        let kept = non_max_suppression(candidates, threshold);

        assert!(kept.iter().all(|k| input.contains(k)));
        for (i, a) in kept.iter().enumerate() {
            for b in kept.iter().skip(i + 1) {
                if a.class_id == b.class_id {
                    assert!(a.rect.iou(&b.rect) <= threshold);
                }
            }
        }
        let top = input
            .iter()
            .copied()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .expect("non-empty");
        assert!(kept.contains(&top), "highest-confidence candidate always survives");
    }

    #[test]
    fn equal_confidence_keeps_input_order() {
        let rect = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let first = candidate(rect, 0.6, 0);
        let second = candidate(rect.translate(0.5, 0.0), 0.6, 0);
        let kept = non_max_suppression(vec![first, second], 0.5);
        assert_eq!(kept, vec![first]);
    }

    #[test]
    fn apply_nms_caps_result_count() {
        let candidates: Vec<Candidate> = (0..10)
            .map(|i| {
                let x = i as f32 * 100.0;
                candidate(BoundingBox::new(x, 0.0, x + 10.0, 10.0), 0.5 + i as f32 * 0.01, 0)
            })
            .collect();
        let kept = apply_nms(candidates, &ThresholdConfig::default(), 3);
        assert_eq!(kept.len(), 3);
        assert!(kept[0].confidence >= kept[1].confidence);
    }

    #[test]
    fn thresholds_validate_range() {
        assert!(ThresholdConfig::default().validate().is_ok());
        let bad = ThresholdConfig {
            confidence: 1.5,
            iou: 0.5,
        };
        assert!(bad.validate().is_err());
        let nan = ThresholdConfig {
            confidence: 0.5,
            iou: f32::NAN,
        };
        assert!(nan.validate().is_err());
    }

    #[test]
    fn converts_detection_settings() {
        let settings = DetectionSettings {
            confidence: 0.4,
            iou: 0.5,
            ..DetectionSettings::default()
        };
        let thresholds = ThresholdConfig::from(&settings);
        assert_eq!(thresholds.confidence, 0.4);
        assert_eq!(thresholds.iou, 0.5);
    }
}
