//! Image preparation shared by validation, training and recognition.
//!
//! Training and recognition must produce face samples the same way or the
//! classifier's distances stop meaning anything, so both go through
//! [`Preprocessor::face_sample`].

use std::path::Path;

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{BoundingBox, FaceSample, FACE_SIZE};

/// Whole-image contrast normalization applied before detection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Normalization {
    None,
    /// Global histogram equalization.
    #[default]
    Equalize,
    /// Contrast-limited adaptive histogram equalization over a square tile grid.
    Clahe { tiles: u32, clip_limit: f32 },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Preprocessor {
    normalization: Normalization,
}

impl Preprocessor {
    pub fn new(normalization: Normalization) -> Self {
        Self { normalization }
    }

    /// Grayscale + normalization: the form the locator sees.
    pub fn prepare(&self, image: &DynamicImage) -> GrayImage {
        let gray = image.to_luma8();
        self.normalize(gray)
    }

    pub fn normalize(&self, mut gray: GrayImage) -> GrayImage {
        match self.normalization {
            Normalization::None => gray,
            Normalization::Equalize => equalize(&gray),
            Normalization::Clahe { tiles, clip_limit } => {
                clahe_enhance(&mut gray, tiles, clip_limit);
                gray
            }
        }
    }

    /// Crop the face region, resize to the canonical size and equalize.
    pub fn face_sample(&self, gray: &GrayImage, face: &BoundingBox) -> Result<FaceSample> {
        let roi = face
            .clamp_to(gray.width(), gray.height())
            .ok_or(Error::InvalidSample { width: 0, height: 0 })?;
        let crop = imageops::crop_imm(gray, roi.x, roi.y, roi.width, roi.height).to_image();
        let resized = imageops::resize(&crop, FACE_SIZE, FACE_SIZE, FilterType::Triangle);
        FaceSample::new(equalize(&resized))
    }
}

pub fn load_image(path: &Path) -> Result<DynamicImage> {
    image::open(path).map_err(|source| Error::ImageRead {
        path: path.to_path_buf(),
        source,
    })
}

pub fn equalize(gray: &GrayImage) -> GrayImage {
    imageproc::contrast::equalize_histogram(gray)
}

/// Apply CLAHE in place.
///
/// Builds a clipped CDF per tile and maps each pixel by bilinear interpolation
/// between the four nearest tile CDFs.
pub fn clahe_enhance(gray: &mut GrayImage, tiles: u32, clip_limit: f32) {
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    let t = tiles.max(1) as usize;
    let tile_w = w / t;
    let tile_h = h / t;
    if tile_w == 0 || tile_h == 0 {
        return;
    }
    let tile_pixels = (tile_w * tile_h) as f32;
    let clip = ((clip_limit * tile_pixels) as u32).max(1);

    let mut cdfs: Vec<[f32; 256]> = Vec::with_capacity(t * t);
    for row in 0..t {
        for col in 0..t {
            let mut hist = [0u32; 256];
            for y in row * tile_h..(row + 1) * tile_h {
                for x in col * tile_w..(col + 1) * tile_w {
                    hist[gray.get_pixel(x as u32, y as u32).0[0] as usize] += 1;
                }
            }

            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > clip {
                    excess += *bin - clip;
                    *bin = clip;
                }
            }
            let share = excess / 256;
            let leftover = (excess % 256) as usize;
            for (i, bin) in hist.iter_mut().enumerate() {
                *bin += share + u32::from(i < leftover);
            }

            let mut cdf = [0f32; 256];
            let mut acc = 0f32;
            for (i, &count) in hist.iter().enumerate() {
                acc += count as f32;
                cdf[i] = acc;
            }
            let cdf_min = cdf.iter().copied().find(|&v| v > 0.0).unwrap_or(0.0);
            let denom = tile_pixels - cdf_min;
            if denom > 0.0 {
                for v in cdf.iter_mut() {
                    *v = ((*v - cdf_min) / denom * 255.0).clamp(0.0, 255.0);
                }
            }
            cdfs.push(cdf);
        }
    }

    let last = (t - 1) as f32;
    for (x, y, px) in gray.enumerate_pixels_mut() {
        let value = px.0[0] as usize;
        let fy = (y as f32 / tile_h as f32 - 0.5).clamp(0.0, last);
        let fx = (x as f32 / tile_w as f32 - 0.5).clamp(0.0, last);
        let (r0, c0) = (fy as usize, fx as usize);
        let (r1, c1) = ((r0 + 1).min(t - 1), (c0 + 1).min(t - 1));
        let (dy, dx) = (fy - r0 as f32, fx - c0 as f32);

        let top = cdfs[r0 * t + c0][value] * (1.0 - dx) + cdfs[r0 * t + c1][value] * dx;
        let bottom = cdfs[r1 * t + c0][value] * (1.0 - dx) + cdfs[r1 * t + c1][value] * dx;
        px.0[0] = (top * (1.0 - dy) + bottom * dy).round().clamp(0.0, 255.0) as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn stddev(img: &GrayImage) -> f32 {
        let n = img.len() as f32;
        let mean = img.iter().map(|&p| p as f32).sum::<f32>() / n;
        (img.iter().map(|&p| (p as f32 - mean).powi(2)).sum::<f32>() / n).sqrt()
    }

    fn low_contrast(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| Luma([100 + ((x + y * w) % 11) as u8]))
    }

    #[test]
    fn test_clahe_increases_contrast() {
        let mut img = low_contrast(16, 16);
        let before = stddev(&img);
        clahe_enhance(&mut img, 2, 0.02);
        assert!(stddev(&img) > before);
    }

    #[test]
    fn test_clahe_ignores_tiny_image() {
        let mut img = low_contrast(3, 3);
        let copy = img.clone();
        clahe_enhance(&mut img, 8, 0.02);
        assert_eq!(img, copy);
    }

    #[test]
    fn test_equalize_stretches_range() {
        let img = low_contrast(32, 32);
        let eq = equalize(&img);
        let max = eq.iter().copied().max().unwrap_or(0);
        assert!(max > 200, "max after equalization: {max}");
    }

    #[test]
    fn test_face_sample_is_canonical_size() {
        let gray = low_contrast(320, 240);
        let sample = Preprocessor::default()
            .face_sample(&gray, &BoundingBox::new(40, 30, 150, 150))
            .unwrap();
        assert_eq!(sample.image().dimensions(), (FACE_SIZE, FACE_SIZE));
    }

    #[test]
    fn test_face_sample_outside_image_fails() {
        let gray = low_contrast(50, 50);
        assert!(Preprocessor::default()
            .face_sample(&gray, &BoundingBox::new(60, 60, 10, 10))
            .is_err());
    }

    #[test]
    fn test_prepare_converts_to_gray() {
        let rgb = DynamicImage::new_rgb8(20, 10);
        let gray = Preprocessor::new(Normalization::None).prepare(&rgb);
        assert_eq!(gray.dimensions(), (20, 10));
    }
}
