//! Aspect-preserving letterbox geometry.
//!
//! A frame of `orig_w x orig_h` is scaled by a single factor so that it fits inside the
//! model input, never upscaling, and the remaining area is padded. [`LetterboxParams`]
//! records the transform so detections can be mapped back into frame coordinates.

use yolo_utils::config::{LetterboxSettings, PaddingStyle};

/// Constant grey used for padded pixels, in 0..=255 units before normalization.
pub const LETTERBOX_FILL: f32 = 114.0;

/// Where padding is placed around the scaled content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaddingMode {
    /// `floor(remaining / 2)` on the leading side, the rest trailing.
    #[default]
    Centered,
    /// Leading pad rounded down to a multiple of `stride`; the trailing side absorbs the rest.
    StrideAligned { stride: u32 },
}

impl PaddingMode {
    fn leading(self, remaining: u32) -> u32 {
        match self {
            PaddingMode::Centered => remaining / 2,
            PaddingMode::StrideAligned { stride } => {
                let stride = stride.max(1);
                (remaining / 2 / stride) * stride
            }
        }
    }
}

impl From<&LetterboxSettings> for PaddingMode {
    fn from(settings: &LetterboxSettings) -> Self {
        match settings.padding {
            PaddingStyle::Centered => PaddingMode::Centered,
            PaddingStyle::StrideAligned => PaddingMode::StrideAligned {
                stride: settings.stride,
            },
        }
    }
}

/// Parameters of one letterbox transform. Produced per frame, never mutated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxParams {
    /// Uniform scale from frame to model space, in `(0, 1]`.
    pub scale: f32,
    /// Leading horizontal padding in model pixels.
    pub pad_x: u32,
    /// Leading vertical padding in model pixels.
    pub pad_y: u32,
    pub orig_width: u32,
    pub orig_height: u32,
    pub model_width: u32,
    pub model_height: u32,
    /// Width of the scaled content inside the model input.
    pub scaled_width: u32,
    /// Height of the scaled content inside the model input.
    pub scaled_height: u32,
}

impl LetterboxParams {
    /// Compute the transform for a frame of `orig` pixels into a model input of `model`.
    ///
    /// Both sizes must be non-zero.
    pub fn compute(orig: (u32, u32), model: (u32, u32), padding: PaddingMode) -> Self {
        let (orig_width, orig_height) = (orig.0.max(1), orig.1.max(1));
        let (model_width, model_height) = (model.0.max(1), model.1.max(1));

        let scale = (model_width as f32 / orig_width as f32)
            .min(model_height as f32 / orig_height as f32)
            .min(1.0);

        let scaled_width = scaled_extent(orig_width, scale, model_width);
        let scaled_height = scaled_extent(orig_height, scale, model_height);

        Self {
            scale,
            pad_x: padding.leading(model_width - scaled_width),
            pad_y: padding.leading(model_height - scaled_height),
            orig_width,
            orig_height,
            model_width,
            model_height,
            scaled_width,
            scaled_height,
        }
    }

    /// Map a frame-space x coordinate into model space.
    pub fn forward_x(&self, x: f32) -> f32 {
        x * self.scale + self.pad_x as f32
    }

    /// Map a frame-space y coordinate into model space.
    pub fn forward_y(&self, y: f32) -> f32 {
        y * self.scale + self.pad_y as f32
    }

    /// Map a model-space x coordinate back into the frame, clamped to `[0, orig_width]`.
    pub fn inverse_x(&self, x: f32) -> f32 {
        ((x - self.pad_x as f32) / self.scale).clamp(0.0, self.orig_width as f32)
    }

    /// Map a model-space y coordinate back into the frame, clamped to `[0, orig_height]`.
    pub fn inverse_y(&self, y: f32) -> f32 {
        ((y - self.pad_y as f32) / self.scale).clamp(0.0, self.orig_height as f32)
    }

    /// Frame-to-source sampling ratio along x for the scaled content.
    pub fn sample_ratio_x(&self) -> f32 {
        self.orig_width as f32 / self.scaled_width as f32
    }

    /// Frame-to-source sampling ratio along y for the scaled content.
    pub fn sample_ratio_y(&self) -> f32 {
        self.orig_height as f32 / self.scaled_height as f32
    }
}

fn scaled_extent(orig: u32, scale: f32, limit: u32) -> u32 {
    ((orig as f32 * scale).round() as u32).clamp(1, limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL: (u32, u32) = (640, 640);

    #[test]
    fn wide_frame_is_padded_vertically() {
        let params = LetterboxParams::compute((1280, 720), MODEL, PaddingMode::Centered);
        assert_eq!(params.scale, 0.5);
        assert_eq!((params.scaled_width, params.scaled_height), (640, 360));
        assert_eq!(params.pad_x, 0);
        assert_eq!(params.pad_y, 140);
    }

    #[test]
    fn small_frames_are_never_upscaled() {
        let params = LetterboxParams::compute((100, 50), MODEL, PaddingMode::Centered);
        assert_eq!(params.scale, 1.0);
        assert_eq!((params.scaled_width, params.scaled_height), (100, 50));
        assert_eq!(params.pad_x, 270);
        assert_eq!(params.pad_y, 295);
    }

    #[test]
    fn stride_aligned_padding_rounds_down() {
        let params = LetterboxParams::compute(
            (1280, 720),
            MODEL,
            PaddingMode::StrideAligned { stride: 32 },
        );
        assert_eq!(params.pad_y, 128);
        assert_eq!(params.pad_x, 0);
        assert!(params.pad_y + params.scaled_height <= params.model_height);
    }

    #[test]
    fn forward_then_inverse_round_trips() {
        let sizes = [(1, 1), (1, 999), (640, 640), (641, 17), (1920, 1080), (333, 4000)];
        for padding in [PaddingMode::Centered, PaddingMode::StrideAligned { stride: 32 }] {
            for &(w, h) in &sizes {
                let params = LetterboxParams::compute((w, h), MODEL, padding);
                assert!(params.scale > 0.0 && params.scale <= 1.0);
                assert!(params.pad_x <= params.model_width);
                assert!(params.pad_y <= params.model_height);
                for (x, y) in [(0.0, 0.0), (w as f32 / 3.0, h as f32 / 2.0), (w as f32, h as f32)] {
                    let rx = params.inverse_x(params.forward_x(x));
                    let ry = params.inverse_y(params.forward_y(y));
                    assert!((rx - x).abs() < 0.5, "x {x} -> {rx} for {w}x{h}");
                    assert!((ry - y).abs() < 0.5, "y {y} -> {ry} for {w}x{h}");
                }
            }
        }
    }

    #[test]
    fn content_points_survive_inverse_then_forward() {
        let sizes = [(1, 1), (1, 999), (640, 640), (641, 17), (1920, 1080), (333, 4000)];
        for padding in [PaddingMode::Centered, PaddingMode::StrideAligned { stride: 32 }] {
            for &(w, h) in &sizes {
                let params = LetterboxParams::compute((w, h), MODEL, padding);
                let content_w = w as f32 * params.scale;
                let content_h = h as f32 * params.scale;
                for t in [0.0, 0.25, 0.5, 0.9, 1.0] {
                    let mx = params.pad_x as f32 + t * content_w;
                    let my = params.pad_y as f32 + t * content_h;
                    let back_x = params.forward_x(params.inverse_x(mx));
                    let back_y = params.forward_y(params.inverse_y(my));
                    assert!((back_x - mx).abs() < 1e-2, "x {mx} -> {back_x} for {w}x{h}");
                    assert!((back_y - my).abs() < 1e-2, "y {my} -> {back_y} for {w}x{h}");
                }
            }
        }
    }

    #[test]
    fn inverse_clamps_into_frame() {
        let params = LetterboxParams::compute((1280, 720), MODEL, PaddingMode::Centered);
        assert_eq!(params.inverse_y(0.0), 0.0);
        assert_eq!(params.inverse_y(640.0), 720.0);
        assert_eq!(params.inverse_x(-50.0), 0.0);
    }

    #[test]
    fn settings_select_padding_mode() {
        let settings = LetterboxSettings {
            padding: PaddingStyle::StrideAligned,
            stride: 64,
        };
        assert_eq!(
            PaddingMode::from(&settings),
            PaddingMode::StrideAligned { stride: 64 }
        );
    }
}
