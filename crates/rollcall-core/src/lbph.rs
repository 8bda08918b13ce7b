//! Texture classifier seam and the LBPH nearest-neighbor implementation.
//!
//! LBPH: circular local binary patterns, per-cell histograms over a spatial
//! grid, nearest neighbor under the alternative chi-square distance.

use std::f64::consts::PI;
use std::io::{Read, Write};

use image::GrayImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{FaceSample, Label, Prediction};

const LBP_EPSILON: f64 = f64::EPSILON;
const MAX_NEIGHBORS: u32 = 16;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("classifier has not been trained")]
    NotTrained,
    #[error("training set is empty")]
    EmptyTrainingSet,
    #[error("{samples} samples but {labels} labels")]
    LengthMismatch { samples: usize, labels: usize },
    #[error("invalid LBPH parameters: {0}")]
    InvalidParams(String),
    #[error("corrupt model state: {0}")]
    CorruptState(String),
    #[error("model i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("model format: {0}")]
    Format(#[from] serde_json::Error),
}

/// A trainable `(label, distance)` predictor over face samples.
pub trait TextureClassifier: Send + Sync {
    /// Rebuild the whole index from `samples`; any previous state is dropped.
    fn train(&mut self, samples: &[FaceSample], labels: &[Label]) -> Result<(), ClassifierError>;

    fn predict(&self, sample: &FaceSample) -> Result<Prediction, ClassifierError>;

    fn save(&self, writer: &mut dyn Write) -> Result<(), ClassifierError>;

    fn load(reader: &mut dyn Read) -> Result<Self, ClassifierError>
    where
        Self: Sized;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LbphParams {
    pub radius: u32,
    pub neighbors: u32,
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            radius: 1,
            neighbors: 8,
            grid_x: 8,
            grid_y: 8,
        }
    }
}

impl LbphParams {
    pub fn validate(&self) -> Result<(), ClassifierError> {
        if self.radius == 0 {
            return Err(ClassifierError::InvalidParams("radius must be >= 1".into()));
        }
        if self.neighbors == 0 || self.neighbors > MAX_NEIGHBORS {
            return Err(ClassifierError::InvalidParams(format!(
                "neighbors must be in 1..={MAX_NEIGHBORS}, got {}",
                self.neighbors
            )));
        }
        if self.grid_x == 0 || self.grid_y == 0 {
            return Err(ClassifierError::InvalidParams("grid must be at least 1x1".into()));
        }
        Ok(())
    }

    fn bins(&self) -> usize {
        1usize << self.neighbors
    }

    fn histogram_len(&self) -> usize {
        self.bins() * (self.grid_x * self.grid_y) as usize
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LbphRecognizer {
    params: LbphParams,
    labels: Vec<Label>,
    histograms: Vec<Vec<f32>>,
}

impl LbphRecognizer {
    pub fn new(params: LbphParams) -> Result<Self, ClassifierError> {
        params.validate()?;
        Ok(Self {
            params,
            labels: Vec::new(),
            histograms: Vec::new(),
        })
    }

    pub fn params(&self) -> &LbphParams {
        &self.params
    }

    pub fn sample_count(&self) -> usize {
        self.histograms.len()
    }

    fn describe(&self, sample: &FaceSample) -> Result<Vec<f32>, ClassifierError> {
        let codes = elbp(sample.image(), self.params.radius, self.params.neighbors);
        spatial_histogram(&codes, &self.params)
    }
}

impl TextureClassifier for LbphRecognizer {
    fn train(&mut self, samples: &[FaceSample], labels: &[Label]) -> Result<(), ClassifierError> {
        if samples.is_empty() {
            return Err(ClassifierError::EmptyTrainingSet);
        }
        if samples.len() != labels.len() {
            return Err(ClassifierError::LengthMismatch {
                samples: samples.len(),
                labels: labels.len(),
            });
        }

        let histograms = samples.iter().map(|s| self.describe(s)).collect::<Result<Vec<_>, _>>()?;
        self.histograms = histograms;
        self.labels = labels.to_vec();
        tracing::info!(samples = self.histograms.len(), "LBPH index rebuilt");
        Ok(())
    }

    fn predict(&self, sample: &FaceSample) -> Result<Prediction, ClassifierError> {
        let query = self.describe(sample)?;
        let mut best: Option<Prediction> = None;
        for (hist, &label) in self.histograms.iter().zip(&self.labels) {
            let distance = chi_square(hist, &query);
            if best.map_or(true, |b| distance < b.distance) {
                best = Some(Prediction { label, distance });
            }
        }
        best.ok_or(ClassifierError::NotTrained)
    }

    fn save(&self, writer: &mut dyn Write) -> Result<(), ClassifierError> {
        serde_json::to_writer(&mut *writer, self)?;
        writer.flush()?;
        Ok(())
    }

    fn load(reader: &mut dyn Read) -> Result<Self, ClassifierError> {
        let model: LbphRecognizer = serde_json::from_reader(reader)?;
        model.params.validate()?;
        if model.labels.len() != model.histograms.len() {
            return Err(ClassifierError::CorruptState(format!(
                "{} labels for {} histograms",
                model.labels.len(),
                model.histograms.len()
            )));
        }
        let expected = model.params.histogram_len();
        if let Some(bad) = model.histograms.iter().find(|h| h.len() != expected) {
            return Err(ClassifierError::CorruptState(format!(
                "histogram of length {} (expected {expected})",
                bad.len()
            )));
        }
        Ok(model)
    }
}

/// Extended (circular) LBP codes with bilinear sampling.
///
/// Output is `(w - 2r) × (h - 2r)` codes, row-major.
fn elbp(src: &GrayImage, radius: u32, neighbors: u32) -> CodeMap {
    let (w, h) = src.dimensions();
    let r = radius as i64;
    let out_w = (w as i64 - 2 * r).max(0) as usize;
    let out_h = (h as i64 - 2 * r).max(0) as usize;
    let mut codes = vec![0u32; out_w * out_h];
    let px = |x: i64, y: i64| src.get_pixel(x as u32, y as u32).0[0] as f64;

    for n in 0..neighbors {
        let angle = 2.0 * PI * n as f64 / neighbors as f64;
        let sx = radius as f64 * angle.cos();
        let sy = -(radius as f64) * angle.sin();
        let (fx, fy) = (sx.floor() as i64, sy.floor() as i64);
        let (cx, cy) = (sx.ceil() as i64, sy.ceil() as i64);
        let (tx, ty) = (sx - fx as f64, sy - fy as f64);
        let w1 = (1.0 - tx) * (1.0 - ty);
        let w2 = tx * (1.0 - ty);
        let w3 = (1.0 - tx) * ty;
        let w4 = tx * ty;

        for y in 0..out_h as i64 {
            for x in 0..out_w as i64 {
                let (i, j) = (y + r, x + r);
                let t = w1 * px(j + fx, i + fy)
                    + w2 * px(j + cx, i + fy)
                    + w3 * px(j + fx, i + cy)
                    + w4 * px(j + cx, i + cy);
                let center = px(j, i);
                if t > center || (t - center).abs() < LBP_EPSILON {
                    codes[y as usize * out_w + x as usize] |= 1 << n;
                }
            }
        }
    }

    CodeMap {
        width: out_w,
        height: out_h,
        codes,
    }
}

struct CodeMap {
    width: usize,
    height: usize,
    codes: Vec<u32>,
}

/// Concatenated per-cell histograms, each normalized to sum to 1.
fn spatial_histogram(map: &CodeMap, params: &LbphParams) -> Result<Vec<f32>, ClassifierError> {
    let (gx, gy) = (params.grid_x as usize, params.grid_y as usize);
    let cell_w = map.width / gx;
    let cell_h = map.height / gy;
    if cell_w == 0 || cell_h == 0 {
        return Err(ClassifierError::InvalidParams(format!(
            "{}x{} grid does not fit a {}x{} code map",
            gx, gy, map.width, map.height
        )));
    }

    let bins = params.bins();
    let mut out = vec![0f32; params.histogram_len()];
    let cell_total = (cell_w * cell_h) as f32;
    for row in 0..gy {
        for col in 0..gx {
            let hist = &mut out[(row * gx + col) * bins..(row * gx + col + 1) * bins];
            for y in row * cell_h..(row + 1) * cell_h {
                for x in col * cell_w..(col + 1) * cell_w {
                    hist[map.codes[y * map.width + x] as usize] += 1.0;
                }
            }
            for v in hist.iter_mut() {
                *v /= cell_total;
            }
        }
    }
    Ok(out)
}

/// Alternative chi-square distance: `Σ 2(a−b)² / (a+b)`.
fn chi_square(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let (x, y) = (x as f64, y as f64);
            let sum = x + y;
            if sum > 0.0 {
                2.0 * (x - y).powi(2) / sum
            } else {
                0.0
            }
        })
        .sum()
}
