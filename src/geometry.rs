use serde::{Deserialize, Serialize};

use crate::errors::{FusionError, FusionResult};

/// Axis-aligned box in pixel space, serialized as `[x_min, y_min, x_max, y_max]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct BBox {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

/// Box relative to the image, as written by the detector: all values in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CenterBox {
    pub x_center: f64,
    pub y_center: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u32; 2]", into = "[u32; 2]")]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

/// How an OCR quadrilateral is reduced to an axis-aligned box.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum QuadMode {
    /// Corner 0 is top-left and corner 2 is bottom-right; the ordering is checked.
    #[default]
    Corners,
    /// Min/max over all four corners, any ordering.
    Envelope,
}

pub type Quad = [[f64; 2]; 4];

impl BBox {
    pub fn from_corners(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> Self {
        Self {
            x_min,
            y_min,
            x_max,
            y_max,
        }
    }

    /// Relative center-form to absolute pixels. No clamping to the image bounds.
    pub fn from_center_form(center: CenterBox, size: ImageSize) -> Self {
        let img_width = f64::from(size.width);
        let img_height = f64::from(size.height);
        let half_width = center.width / 2.0;
        let half_height = center.height / 2.0;

        Self {
            x_min: (center.x_center - half_width) * img_width,
            y_min: (center.y_center - half_height) * img_height,
            x_max: (center.x_center + half_width) * img_width,
            y_max: (center.y_center + half_height) * img_height,
        }
    }

    pub fn to_center_form(&self, size: ImageSize) -> CenterBox {
        let img_width = f64::from(size.width);
        let img_height = f64::from(size.height);

        CenterBox {
            x_center: (self.x_min + self.x_max) / (2.0 * img_width),
            y_center: (self.y_min + self.y_max) / (2.0 * img_height),
            width: (self.x_max - self.x_min) / img_width,
            height: (self.y_max - self.y_min) / img_height,
        }
    }

    pub fn from_quad(quad: &Quad, mode: QuadMode) -> FusionResult<Self> {
        match mode {
            QuadMode::Corners => {
                let [top_left, _, bottom_right, _] = quad;
                if top_left[0] > bottom_right[0] || top_left[1] > bottom_right[1] {
                    return Err(FusionError::MalformedInput(format!(
                        "quadrilateral corners out of order: corner 0 ({}, {}) is not above-left of corner 2 ({}, {})",
                        top_left[0], top_left[1], bottom_right[0], bottom_right[1]
                    )));
                }
                Ok(Self::from_corners(
                    top_left[0],
                    top_left[1],
                    bottom_right[0],
                    bottom_right[1],
                ))
            }
            QuadMode::Envelope => {
                let mut bbox = Self::from_corners(
                    f64::INFINITY,
                    f64::INFINITY,
                    f64::NEG_INFINITY,
                    f64::NEG_INFINITY,
                );
                for [x, y] in quad {
                    bbox.x_min = bbox.x_min.min(*x);
                    bbox.y_min = bbox.y_min.min(*y);
                    bbox.x_max = bbox.x_max.max(*x);
                    bbox.y_max = bbox.y_max.max(*y);
                }
                Ok(bbox)
            }
        }
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.x_min + self.x_max) / 2.0,
            (self.y_min + self.y_max) / 2.0,
        )
    }

    pub fn center_distance(&self, other: &BBox) -> f64 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        (ax - bx).hypot(ay - by)
    }
}

impl From<[f64; 4]> for BBox {
    fn from(value: [f64; 4]) -> Self {
        Self::from_corners(value[0], value[1], value[2], value[3])
    }
}

impl From<BBox> for [f64; 4] {
    fn from(value: BBox) -> Self {
        [value.x_min, value.y_min, value.x_max, value.y_max]
    }
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl From<[u32; 2]> for ImageSize {
    fn from(value: [u32; 2]) -> Self {
        Self::new(value[0], value[1])
    }
}

impl From<ImageSize> for [u32; 2] {
    fn from(value: ImageSize) -> Self {
        [value.width, value.height]
    }
}
