//! Deterministic geometric augmentation of face samples.

use image::{imageops, Luma};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use serde::{Deserialize, Serialize};

use crate::types::FaceSample;

/// Rotation angles (degrees, counter-clockwise) added per training face.
pub const DEFAULT_TRAINING_ROTATIONS: [f32; 4] = [-7.0, -3.0, 3.0, 7.0];

/// Probe angles tried per face at recognition time. 0 is the crop itself.
pub const DEFAULT_PROBE_ANGLES: [f32; 3] = [0.0, -5.0, 5.0];

/// Out-of-bounds fill after rotation (constant black border).
const BORDER: Luma<u8> = Luma([0]);

/// Expands one face crop into a fixed, reproducible set of variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Augmenter {
    /// Small-angle rotations about the crop center.
    pub rotations: Vec<f32>,
    /// Add one left-right mirror.
    pub flip: bool,
}

impl Default for Augmenter {
    fn default() -> Self {
        Self {
            rotations: DEFAULT_TRAINING_ROTATIONS.to_vec(),
            flip: true,
        }
    }
}

impl Augmenter {
    /// No expansion at all: `expand` returns just the source.
    pub fn disabled() -> Self {
        Self {
            rotations: Vec::new(),
            flip: false,
        }
    }

    /// Number of samples `expand` yields per source crop.
    pub fn variants_per_sample(&self) -> usize {
        1 + usize::from(self.flip) + self.rotations.len()
    }

    /// Source first, then the flip (if enabled), then rotations in order.
    pub fn expand(&self, sample: &FaceSample) -> Vec<FaceSample> {
        let mut out = Vec::with_capacity(self.variants_per_sample());
        out.push(sample.clone());
        if self.flip {
            out.push(flip_horizontal(sample));
        }
        out.extend(self.rotations.iter().map(|&angle| rotate(sample, angle)));
        out
    }
}

/// One probe per angle; angle 0 is passed through untouched.
pub fn probes(sample: &FaceSample, angles: &[f32]) -> Vec<FaceSample> {
    angles
        .iter()
        .map(|&angle| {
            if angle == 0.0 {
                sample.clone()
            } else {
                rotate(sample, angle)
            }
        })
        .collect()
}

/// Rotate counter-clockwise by `degrees` about the center, no scaling.
pub fn rotate(sample: &FaceSample, degrees: f32) -> FaceSample {
    // imageproc rotates clockwise for positive theta.
    let rotated = rotate_about_center(
        sample.image(),
        -degrees.to_radians(),
        Interpolation::Bilinear,
        BORDER,
    );
    FaceSample::derived(rotated)
}

pub fn flip_horizontal(sample: &FaceSample) -> FaceSample {
    FaceSample::derived(imageops::flip_horizontal(sample.image()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FACE_SIZE;
    use image::GrayImage;

    fn gradient_sample() -> FaceSample {
        let image =
            GrayImage::from_fn(FACE_SIZE, FACE_SIZE, |x, y| Luma([((x * 2 + y) % 256) as u8]));
        FaceSample::new(image).unwrap()
    }

    #[test]
    fn test_expand_count_and_order() {
        let sample = gradient_sample();
        let aug = Augmenter::default();
        let variants = aug.expand(&sample);
        assert_eq!(variants.len(), 6);
        assert_eq!(variants.len(), aug.variants_per_sample());
        assert_eq!(variants[0], sample);
        assert_eq!(variants[1], flip_horizontal(&sample));
    }

    #[test]
    fn test_expand_is_reproducible() {
        let sample = gradient_sample();
        let aug = Augmenter::default();
        assert_eq!(aug.expand(&sample), aug.expand(&sample));
    }

    #[test]
    fn test_disabled_returns_source_only() {
        let sample = gradient_sample();
        assert_eq!(Augmenter::disabled().expand(&sample), vec![sample]);
    }

    #[test]
    fn test_flip_mirrors_pixels() {
        let sample = gradient_sample();
        let flipped = flip_horizontal(&sample);
        assert_eq!(
            flipped.image().get_pixel(0, 10),
            sample.image().get_pixel(FACE_SIZE - 1, 10)
        );
    }

    #[test]
    fn test_rotation_keeps_size_and_changes_pixels() {
        let sample = gradient_sample();
        let rotated = rotate(&sample, 7.0);
        assert_eq!(rotated.image().dimensions(), (FACE_SIZE, FACE_SIZE));
        assert_ne!(rotated, sample);
        // Corners fall outside the source after rotation.
        assert_eq!(rotated.image().get_pixel(0, 0).0[0], 0);
    }

    #[test]
    fn test_probes_zero_angle_is_identity() {
        let sample = gradient_sample();
        let p = probes(&sample, &DEFAULT_PROBE_ANGLES);
        assert_eq!(p.len(), 3);
        assert_eq!(p[0], sample);
    }
}
