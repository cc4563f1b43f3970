//! Decoding raw detector outputs into [`Candidate`]s.
//!
//! Two output families are supported and told apart once, from the output shape:
//!
//! * **Flat box list** `[1, 300, 6]`: NMS-free heads emit rows of
//!   `[left, top, right, bottom, confidence, class]`.
//! * **Dense grid** `[1, 4 + classes, positions]`: channel-major, the first four channels
//!   hold `(cx, cy, w, h)` and the rest hold one score per class.

use std::fmt;

use anyhow::Result;
use serde::Serialize;
use yolo_utils::config::BoxUnits;

use crate::mapping::normalized_to_model;
use crate::postprocess::{BoundingBox, Candidate, ThresholdConfig};

/// Rows emitted by flat box-list heads.
pub const FLAT_BOX_ROWS: usize = 300;
/// Values per flat box-list row.
pub const FLAT_BOX_COLS: usize = 6;
/// Box channels preceding the class scores in a dense grid.
pub const BOX_CHANNELS: usize = 4;

/// Structural family of the model output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLayout {
    DenseGrid,
    FlatBoxList,
}

/// Output geometry derived once when a model is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OutputShape {
    pub num_detections: usize,
    /// Number of class channels. Zero for flat box lists, which carry the class inline.
    pub num_classes: usize,
    pub layout: OutputLayout,
}

impl OutputShape {
    /// Classify an output tensor shape. A leading batch dimension of 1 is optional.
    pub fn from_dims(dims: &[usize]) -> Result<Self> {
        let (rows, cols) = match dims {
            [1, rows, cols] | [rows, cols] => (*rows, *cols),
            other => anyhow::bail!(
                "detector output must have shape [1, R, C] or [R, C] (got {:?})",
                other
            ),
        };

        if rows == FLAT_BOX_ROWS && cols == FLAT_BOX_COLS {
            return Ok(Self {
                num_detections: FLAT_BOX_ROWS,
                num_classes: 0,
                layout: OutputLayout::FlatBoxList,
            });
        }

        anyhow::ensure!(
            rows > BOX_CHANNELS,
            "dense-grid output needs more than {BOX_CHANNELS} channels (got {rows})"
        );
        anyhow::ensure!(cols > 0, "dense-grid output has no positions");
        Ok(Self {
            num_detections: cols,
            num_classes: rows - BOX_CHANNELS,
            layout: OutputLayout::DenseGrid,
        })
    }

    /// Number of `f32` values an output of this shape holds.
    pub fn element_count(&self) -> usize {
        match self.layout {
            OutputLayout::FlatBoxList => self.num_detections * FLAT_BOX_COLS,
            OutputLayout::DenseGrid => self.num_detections * (self.num_classes + BOX_CHANNELS),
        }
    }
}

impl fmt::Display for OutputShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.layout {
            OutputLayout::FlatBoxList => write!(f, "flat box list ({} rows)", self.num_detections),
            OutputLayout::DenseGrid => write!(
                f,
                "dense grid ({} classes x {} positions)",
                self.num_classes, self.num_detections
            ),
        }
    }
}

/// How decoded box coordinates are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {
    pub box_units: BoxUnits,
    pub model_width: u32,
    pub model_height: u32,
}

impl DecodeOptions {
    fn to_model_pixels(&self, rect: BoundingBox) -> BoundingBox {
        match self.box_units {
            BoxUnits::Pixels => rect,
            BoxUnits::Normalized => normalized_to_model(&rect, self.model_width, self.model_height),
        }
    }
}

/// Decode a raw output buffer into candidates in model-input pixels.
///
/// Candidates below `thresholds.confidence`, with a non-finite confidence, or with an
/// invalid class id are dropped. No suppression happens here.
pub fn decode_output(
    data: &[f32],
    shape: &OutputShape,
    thresholds: &ThresholdConfig,
    options: &DecodeOptions,
) -> Result<Vec<Candidate>> {
    anyhow::ensure!(
        data.len() == shape.element_count(),
        "output holds {} values but {} expects {}",
        data.len(),
        shape,
        shape.element_count()
    );

    let candidates = match shape.layout {
        OutputLayout::FlatBoxList => decode_flat(data, thresholds.confidence, options),
        OutputLayout::DenseGrid => decode_dense(data, shape, thresholds.confidence, options),
    };
    Ok(candidates)
}

fn decode_flat(data: &[f32], threshold: f32, options: &DecodeOptions) -> Vec<Candidate> {
    data.chunks_exact(FLAT_BOX_COLS)
        .filter_map(|row| {
            let confidence = row[4];
            let class = row[5];
            if !confidence.is_finite() || confidence < threshold {
                return None;
            }
            if !class.is_finite() || class < 0.0 {
                return None;
            }
            Some(Candidate {
                rect: options.to_model_pixels(BoundingBox::new(row[0], row[1], row[2], row[3])),
                confidence,
                class_id: class as usize,
            })
        })
        .collect()
}

fn decode_dense(
    data: &[f32],
    shape: &OutputShape,
    threshold: f32,
    options: &DecodeOptions,
) -> Vec<Candidate> {
    let positions = shape.num_detections;
    let channel = |index: usize| channel_slice(data, positions, index);

    // Sweep class channels row by row so reads stay contiguous; strict `>` keeps the
    // lowest class index on ties.
    let mut best_score = channel(BOX_CHANNELS).to_vec();
    let mut best_class = vec![0usize; positions];
    for class_id in 1..shape.num_classes {
        let scores = channel(BOX_CHANNELS + class_id);
        for ((best, class), &score) in best_score.iter_mut().zip(&mut best_class).zip(scores) {
            if score > *best {
                *best = score;
                *class = class_id;
            }
        }
    }

    let (cx, cy, w, h) = (channel(0), channel(1), channel(2), channel(3));
    best_score
        .iter()
        .zip(&best_class)
        .enumerate()
        .filter(|(_, (score, _))| score.is_finite() && **score >= threshold)
        .map(|(i, (&confidence, &class_id))| Candidate {
            rect: options.to_model_pixels(BoundingBox::from_center(cx[i], cy[i], w[i], h[i])),
            confidence,
            class_id,
        })
        .collect()
}

fn channel_slice(data: &[f32], positions: usize, index: usize) -> &[f32] {
    &data[index * positions..(index + 1) * positions]
}
