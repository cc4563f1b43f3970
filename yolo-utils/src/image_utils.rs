use std::path::Path;

use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView};

use crate::gpu::{pack_rgb_into, pack_rgba_into};

/// File extensions the CLI treats as images when walking a directory.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

/// Load an image from disk into memory.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<DynamicImage> {
    let path_ref = path.as_ref();
    image::open(path_ref).with_context(|| format!("failed to open image {}", path_ref.display()))
}

/// Returns `true` when the path has one of [`IMAGE_EXTENSIONS`] (case-insensitive).
pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|candidate| ext.eq_ignore_ascii_case(candidate))
        })
        .unwrap_or(false)
}

/// Write every pixel of `image` into `out` as packed RGBA `u32` values, row-major.
///
/// `out` is cleared first; its allocation is reused. RGB8 and RGBA8 frames are packed
/// straight from their raw buffers, other pixel formats go through an RGBA8 conversion.
pub fn pack_image_pixels(image: &DynamicImage, out: &mut Vec<u32>) {
    let (width, height) = image.dimensions();
    out.clear();
    out.reserve(width as usize * height as usize);
    match image {
        DynamicImage::ImageRgba8(rgba) => pack_rgba_into(rgba.as_raw(), out),
        DynamicImage::ImageRgb8(rgb) => pack_rgb_into(rgb.as_raw(), out),
        other => pack_rgba_into(other.to_rgba8().as_raw(), out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::packed_channel;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    #[test]
    fn packs_rgb_frames_row_major() {
        let mut image = RgbImage::new(2, 2);
        image.put_pixel(1, 0, Rgb([10, 20, 30]));
        image.put_pixel(0, 1, Rgb([40, 50, 60]));
        let mut packed = vec![7; 16];
        pack_image_pixels(&DynamicImage::ImageRgb8(image), &mut packed);

        assert_eq!(packed.len(), 4);
        assert_eq!(packed_channel(packed[1], 0), 10);
        assert_eq!(packed_channel(packed[1], 2), 30);
        assert_eq!(packed_channel(packed[2], 1), 50);
    }

    #[test]
    fn packs_grayscale_through_conversion() {
        let image = GrayImage::from_pixel(3, 1, Luma([90]));
        let mut packed = Vec::new();
        pack_image_pixels(&DynamicImage::ImageLuma8(image), &mut packed);
        assert_eq!(packed.len(), 3);
        assert!(packed.iter().all(|&p| packed_channel(p, 0) == 90
            && packed_channel(p, 1) == 90
            && packed_channel(p, 2) == 90));
    }

    #[test]
    fn recognizes_image_extensions() {
        assert!(is_image_path(Path::new("frames/a.JPG")));
        assert!(is_image_path(Path::new("b.png")));
        assert!(!is_image_path(Path::new("notes.txt")));
        assert!(!is_image_path(Path::new("no_extension")));
    }
}
