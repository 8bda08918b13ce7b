use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Side length of every face sample fed to the classifier.
pub const FACE_SIZE: u32 = 100;

/// Sentinel identity reported for rejected recognitions.
pub const UNKNOWN_IDENTITY: &str = "Unknown";

/// Opaque identity key (e.g. a student registration number).
pub type Identity = String;

/// Dense integer label understood by the classifier.
pub type Label = u32;

/// Axis-aligned face box in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Intersect with a `width × height` image. `None` if nothing is left.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<BoundingBox> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.width.min(width - self.x);
        let h = self.height.min(height - self.y);
        (w > 0 && h > 0).then(|| BoundingBox::new(self.x, self.y, w, h))
    }
}

/// Pick the box with the largest area; the first one wins ties.
pub fn largest_box(boxes: &[BoundingBox]) -> Option<BoundingBox> {
    let mut best: Option<BoundingBox> = None;
    for candidate in boxes {
        match best {
            Some(current) if candidate.area() <= current.area() => {}
            _ => best = Some(*candidate),
        }
    }
    best
}

/// A canonical `FACE_SIZE × FACE_SIZE` grayscale face crop.
///
/// Always derived from exactly one detected region; immutable after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceSample {
    image: GrayImage,
}

impl FaceSample {
    pub fn new(image: GrayImage) -> Result<Self, Error> {
        if image.width() != FACE_SIZE || image.height() != FACE_SIZE {
            return Err(Error::InvalidSample {
                width: image.width(),
                height: image.height(),
            });
        }
        Ok(Self { image })
    }

    /// For size-preserving transforms of an existing sample.
    pub(crate) fn derived(image: GrayImage) -> Self {
        debug_assert_eq!(image.dimensions(), (FACE_SIZE, FACE_SIZE));
        Self { image }
    }

    pub fn image(&self) -> &GrayImage {
        &self.image
    }

    pub fn into_image(self) -> GrayImage {
        self.image
    }
}

/// One classifier answer: lower distance means more similar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: Label,
    pub distance: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_largest_box_prefers_bigger_area() {
        let boxes = [BoundingBox::new(0, 0, 50, 50), BoundingBox::new(10, 10, 60, 60)];
        assert_eq!(largest_box(&boxes), Some(BoundingBox::new(10, 10, 60, 60)));
    }

    #[test]
    fn test_largest_box_tie_keeps_first() {
        let boxes = [BoundingBox::new(0, 0, 40, 40), BoundingBox::new(100, 100, 40, 40)];
        assert_eq!(largest_box(&boxes), Some(BoundingBox::new(0, 0, 40, 40)));
    }

    #[test]
    fn test_largest_box_empty() {
        assert_eq!(largest_box(&[]), None);
    }

    #[test]
    fn test_clamp_to_trims_overflow() {
        let b = BoundingBox::new(80, 90, 50, 50);
        assert_eq!(b.clamp_to(100, 100), Some(BoundingBox::new(80, 90, 20, 10)));
        assert_eq!(BoundingBox::new(100, 0, 5, 5).clamp_to(100, 100), None);
    }

    #[test]
    fn test_face_sample_rejects_wrong_size() {
        assert!(FaceSample::new(GrayImage::new(64, 100)).is_err());
        assert!(FaceSample::new(GrayImage::new(FACE_SIZE, FACE_SIZE)).is_ok());
    }
}
