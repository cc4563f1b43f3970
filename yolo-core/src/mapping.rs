//! Mapping model-space boxes back into frame coordinates.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::letterbox::LetterboxParams;
use crate::postprocess::BoundingBox;

/// Rectangle in frame coordinates. The origin may lie outside the frame; use
/// [`Region::clamp_to`] before cropping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Intersect with a `frame_width x frame_height` frame.
    ///
    /// Returns `None` when the intersection has no area.
    pub fn clamp_to(&self, frame_width: u32, frame_height: u32) -> Option<Region> {
        let left = i64::from(self.x).max(0);
        let top = i64::from(self.y).max(0);
        let right = (i64::from(self.x) + i64::from(self.width)).min(i64::from(frame_width));
        let bottom = (i64::from(self.y) + i64::from(self.height)).min(i64::from(frame_height));
        if right <= left || bottom <= top {
            return None;
        }
        Some(Region {
            x: left as i32,
            y: top as i32,
            width: (right - left) as u32,
            height: (bottom - top) as u32,
        })
    }

    /// Top-left corner as unsigned pixel coordinates, saturating negatives to zero.
    pub fn origin(&self) -> (u32, u32) {
        (self.x.max(0) as u32, self.y.max(0) as u32)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.x, self.y, self.width, self.height)
    }
}

impl FromStr for Region {
    type Err = String;

    /// Parse `x,y,width,height`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        let [x, y, w, h] = parts.as_slice() else {
            return Err(format!("region must be 'x,y,width,height' (got '{s}')"));
        };
        let parse_err = |name: &str, value: &str| format!("invalid region {name} '{value}'");
        Ok(Region {
            x: x.parse().map_err(|_| parse_err("x", x))?,
            y: y.parse().map_err(|_| parse_err("y", y))?,
            width: w.parse().map_err(|_| parse_err("width", w))?,
            height: h.parse().map_err(|_| parse_err("height", h))?,
        })
    }
}

/// Invert the letterbox on each edge independently; every edge is clamped to the frame.
pub fn map_to_frame(rect: &BoundingBox, params: &LetterboxParams) -> BoundingBox {
    BoundingBox::new(
        params.inverse_x(rect.left),
        params.inverse_y(rect.top),
        params.inverse_x(rect.right),
        params.inverse_y(rect.bottom),
    )
}

/// Invert the letterbox of a cropped frame, then translate by the crop origin.
pub fn map_to_frame_with_offset(
    rect: &BoundingBox,
    params: &LetterboxParams,
    origin: (u32, u32),
) -> BoundingBox {
    map_to_frame(rect, params).translate(origin.0 as f32, origin.1 as f32)
}

/// Convert a box expressed as fractions of the model input into model pixels.
pub fn normalized_to_model(rect: &BoundingBox, model_width: u32, model_height: u32) -> BoundingBox {
    rect.scale(model_width as f32, model_height as f32)
}
