//! Face locator seam and the SCRFD implementation behind it.
//!
//! The pipeline only sees [`FaceLocator`]: a grayscale image goes in, integer
//! boxes come out. [`ScrfdLocator`] runs the SCRFD `det_10g` model through
//! ONNX Runtime, decodes the three stride heads and merges anchor hits with
//! non-maximum suppression.

use std::path::Path;

use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::BoundingBox;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [u32; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download det_10g.onnx from insightface into models/")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Pixel extent used for the min/max face size filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub const fn square(side: u32) -> Self {
        Self {
            width: side,
            height: side,
        }
    }
}

/// Detection knobs handed to every locator call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionParams {
    /// Image pyramid step for multi-scale locators. Must be > 1.0.
    pub scale_factor: f32,
    /// Minimum number of raw hits that must support a reported box.
    pub min_neighbors: u32,
    pub min_size: Extent,
    pub max_size: Extent,
}

impl DetectionParams {
    /// Parameters used while validating enrollment photos.
    pub const ENROLLMENT: DetectionParams = DetectionParams {
        scale_factor: 1.1,
        min_neighbors: 4,
        min_size: Extent::square(30),
        max_size: Extent::square(400),
    };

    pub fn accepts(&self, b: &BoundingBox) -> bool {
        b.width >= self.min_size.width
            && b.height >= self.min_size.height
            && b.width <= self.max_size.width
            && b.height <= self.max_size.height
    }
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self::ENROLLMENT
    }
}

/// Anything that can find faces in a grayscale image.
///
/// Boxes come back in the locator's own order; callers that need a single
/// face apply their own policy on top.
pub trait FaceLocator: Send {
    fn detect(
        &mut self,
        image: &GrayImage,
        params: &DetectionParams,
    ) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Builds one locator per worker thread.
pub type LocatorFactory = dyn Fn() -> Result<Box<dyn FaceLocator>, DetectorError> + Send + Sync;

/// Raw, un-rounded detection in source-image coordinates.
#[derive(Debug, Clone, Copy)]
struct RawDetection {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

/// A kept detection plus how many raw hits were merged into it.
#[derive(Debug, Clone, Copy)]
struct Cluster {
    det: RawDetection,
    support: u32,
}

struct Letterbox {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
}

/// SCRFD-based face locator.
///
/// SCRFD scans a fixed stride pyramid, so `scale_factor` has no effect here;
/// `min_neighbors` is the NMS support vote.
pub struct ScrfdLocator {
    session: Session,
    /// Per-stride (score, bbox) output indices for strides [8, 16, 32].
    heads: [(usize, usize); 3],
}

impl ScrfdLocator {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires score and bbox outputs for 3 strides, got {} outputs",
                output_names.len()
            )));
        }

        let heads = discover_heads(&output_names);
        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            ?heads,
            "loaded SCRFD locator"
        );

        Ok(Self { session, heads })
    }

    fn run(&mut self, image: &GrayImage) -> Result<Vec<RawDetection>, DetectorError> {
        let (input, letterbox) = letterbox_tensor(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut hits = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.heads[pos];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| {
                    DetectorError::InferenceFailed(format!("scores stride {stride}: {e}"))
                })?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| {
                    DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}"))
                })?;
            hits.extend(decode_stride(scores, bboxes, stride, &letterbox));
        }
        Ok(hits)
    }
}

impl FaceLocator for ScrfdLocator {
    fn detect(
        &mut self,
        image: &GrayImage,
        params: &DetectionParams,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }
        let hits = self.run(image)?;
        let raw_count = hits.len();
        let clusters = nms(hits, SCRFD_NMS_THRESHOLD);
        let boxes = finalize(&clusters, params, image.width(), image.height());
        tracing::debug!(
            raw = raw_count,
            clusters = clusters.len(),
            kept = boxes.len(),
            "SCRFD detect"
        );
        Ok(boxes)
    }
}

/// Map SCRFD outputs to stride heads by name (`score_8`, `bbox_8`, ...),
/// falling back to the standard positional layout.
fn discover_heads(names: &[String]) -> [(usize, usize); 3] {
    let find = |prefix: &str, stride: u32| {
        names.iter().position(|n| *n == format!("{prefix}_{stride}"))
    };

    let named: Option<Vec<(usize, usize)>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?)))
        .collect();

    match named {
        Some(v) => [v[0], v[1], v[2]],
        None => {
            tracing::info!(?names, "SCRFD output names not recognized, using positional layout");
            [(0, 3), (1, 4), (2, 5)]
        }
    }
}

/// Resize into the 640×640 input, centered, and normalize to NCHW.
fn letterbox_tensor(image: &GrayImage) -> (Array4<f32>, Letterbox) {
    let (w, h) = image.dimensions();
    let scale = (SCRFD_INPUT_SIZE as f32 / w as f32).min(SCRFD_INPUT_SIZE as f32 / h as f32);
    let new_w = ((w as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let new_h = ((h as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let pad_x = (SCRFD_INPUT_SIZE - new_w) / 2;
    let pad_y = (SCRFD_INPUT_SIZE - new_h) / 2;

    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let side = SCRFD_INPUT_SIZE as usize;
    // Padding normalizes to 0.0.
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, px) in resized.enumerate_pixels() {
        let v = (px.0[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
        let (tx, ty) = ((x + pad_x) as usize, (y + pad_y) as usize);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = v;
        }
    }

    (tensor, Letterbox { scale, pad_x, pad_y })
}

fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: u32,
    letterbox: &Letterbox,
) -> Vec<RawDetection> {
    let grid = (SCRFD_INPUT_SIZE / stride) as usize;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;
    let unmap_x = |v: f32| (v - letterbox.pad_x as f32) / letterbox.scale;
    let unmap_y = |v: f32| (v - letterbox.pad_y as f32) / letterbox.scale;

    (0..anchors)
        .filter_map(|idx| {
            let score = *scores.get(idx)?;
            if score <= SCRFD_CONFIDENCE_THRESHOLD {
                return None;
            }
            let off = idx * 4;
            let d = bboxes.get(off..off + 4)?;
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid) as f32 * s;
            let cy = (cell / grid) as f32 * s;
            Some(RawDetection {
                x1: unmap_x(cx - d[0] * s),
                y1: unmap_y(cy - d[1] * s),
                x2: unmap_x(cx + d[2] * s),
                y2: unmap_y(cy + d[3] * s),
                score,
            })
        })
        .collect()
}

/// Greedy NMS that also counts how many raw hits each kept box absorbed.
fn nms(mut hits: Vec<RawDetection>, iou_threshold: f32) -> Vec<Cluster> {
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut suppressed = vec![false; hits.len()];
    let mut kept = Vec::new();
    for i in 0..hits.len() {
        if suppressed[i] {
            continue;
        }
        let mut support = 1;
        for j in (i + 1)..hits.len() {
            if !suppressed[j] && iou(&hits[i], &hits[j]) > iou_threshold {
                suppressed[j] = true;
                support += 1;
            }
        }
        kept.push(Cluster { det: hits[i], support });
    }
    kept
}

fn iou(a: &RawDetection, b: &RawDetection) -> f32 {
    let inter_w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let inter_h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = inter_w * inter_h;
    let union = (a.x2 - a.x1) * (a.y2 - a.y1) + (b.x2 - b.x1) * (b.y2 - b.y1) - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

/// Apply the support vote, round into pixel space and filter by size.
fn finalize(
    clusters: &[Cluster],
    params: &DetectionParams,
    width: u32,
    height: u32,
) -> Vec<BoundingBox> {
    clusters
        .iter()
        .filter(|c| c.support >= params.min_neighbors)
        .filter_map(|c| {
            let x1 = c.det.x1.max(0.0).round() as u32;
            let y1 = c.det.y1.max(0.0).round() as u32;
            let x2 = c.det.x2.max(0.0).round() as u32;
            let y2 = c.det.y2.max(0.0).round() as u32;
            if x2 <= x1 || y2 <= y1 {
                return None;
            }
            BoundingBox::new(x1, y1, x2 - x1, y2 - y1).clamp_to(width, height)
        })
        .filter(|b| params.accepts(b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(x: f32, y: f32, w: f32, h: f32, score: f32) -> RawDetection {
        RawDetection {
            x1: x,
            y1: y,
            x2: x + w,
            y2: y + h,
            score,
        }
    }

    #[test]
    fn test_iou_partial() {
        let a = raw(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = raw(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
        assert!(iou(&a, &raw(20.0, 20.0, 5.0, 5.0, 1.0)).abs() < 1e-6);
    }

    #[test]
    fn test_nms_counts_support() {
        let hits = vec![
            raw(0.0, 0.0, 100.0, 100.0, 0.9),
            raw(4.0, 4.0, 100.0, 100.0, 0.8),
            raw(2.0, 2.0, 100.0, 100.0, 0.7),
            raw(300.0, 300.0, 50.0, 50.0, 0.6),
        ];
        let clusters = nms(hits, 0.4);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].support, 3);
        assert_eq!(clusters[1].support, 1);
    }

    #[test]
    fn test_finalize_applies_min_neighbors_and_size() {
        let clusters = vec![
            Cluster { det: raw(10.0, 10.0, 80.0, 80.0, 0.9), support: 5 },
            Cluster { det: raw(200.0, 200.0, 80.0, 80.0, 0.8), support: 2 },
            Cluster { det: raw(400.0, 10.0, 12.0, 12.0, 0.8), support: 9 },
        ];
        let boxes = finalize(&clusters, &DetectionParams::ENROLLMENT, 640, 480);
        assert_eq!(boxes, vec![BoundingBox::new(10, 10, 80, 80)]);
    }

    #[test]
    fn test_finalize_clamps_to_image() {
        let clusters = vec![Cluster { det: raw(-5.0, 600.0, 60.0, 100.0, 0.9), support: 4 }];
        let boxes = finalize(&clusters, &DetectionParams::ENROLLMENT, 640, 640);
        assert_eq!(boxes, vec![BoundingBox::new(0, 600, 55, 40)]);
    }

    #[test]
    fn test_discover_heads_named_and_positional() {
        let names: Vec<String> = ["bbox_8", "score_8", "bbox_16", "score_16", "bbox_32", "score_32"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(discover_heads(&names), [(1, 0), (3, 2), (5, 4)]);

        let generic: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_heads(&generic), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_letterbox_centers_wide_image() {
        let image = GrayImage::from_pixel(320, 160, image::Luma([255]));
        let (tensor, lb) = letterbox_tensor(&image);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((lb.scale - 2.0).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0);
        assert_eq!(lb.pad_y, 160);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        assert!(tensor[[0, 0, 320, 320]] > 0.9);
    }

    #[test]
    fn test_load_missing_model() {
        let err = ScrfdLocator::load(Path::new("/nonexistent/det_10g.onnx")).err();
        assert!(matches!(err, Some(DetectorError::ModelNotFound(_))));
    }
}
