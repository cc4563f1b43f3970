//! Debug annotation of detections.

use image::{DynamicImage, Rgba, RgbaImage};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};

use crate::detector::Detection;
use crate::postprocess::BoundingBox;

/// Outline colour for detection boxes.
pub const BOX_COLOR: Rgba<u8> = Rgba([255, 0, 0, 255]);
/// Outline thickness in pixels.
pub const BOX_THICKNESS: u32 = 4;

/// Return a copy of `image` with each detection outlined.
pub fn draw_detections(image: &DynamicImage, detections: &[Detection]) -> DynamicImage {
    let mut canvas = image.to_rgba8();
    for detection in detections {
        outline(&mut canvas, &detection.rect, BOX_COLOR, BOX_THICKNESS);
    }
    DynamicImage::ImageRgba8(canvas)
}

/// Draw `thickness` nested one-pixel outlines, growing inward from `rect`.
pub fn outline(canvas: &mut RgbaImage, rect: &BoundingBox, color: Rgba<u8>, thickness: u32) {
    let (img_w, img_h) = canvas.dimensions();
    if img_w == 0 || img_h == 0 {
        return;
    }
    let max_x = (img_w - 1) as f32;
    let max_y = (img_h - 1) as f32;

    let x1 = rect.left.clamp(0.0, max_x).round() as i32;
    let y1 = rect.top.clamp(0.0, max_y).round() as i32;
    let x2 = rect.right.clamp(0.0, max_x).round() as i32;
    let y2 = rect.bottom.clamp(0.0, max_y).round() as i32;

    for inset in 0..thickness as i32 {
        let (left, top) = (x1 + inset, y1 + inset);
        let (right, bottom) = (x2 - inset, y2 - inset);
        if right < left || bottom < top {
            break;
        }
        let rect = Rect::at(left, top).of_size((right - left + 1) as u32, (bottom - top + 1) as u32);
        draw_hollow_rect_mut(canvas, rect, color);
    }
}
