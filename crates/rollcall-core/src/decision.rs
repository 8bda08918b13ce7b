//! Distance → confidence calibration and accept/reject thresholds.

use serde::{Deserialize, Serialize};

use crate::types::BoundingBox;

/// Maps a classifier distance to a confidence in `[0, 100]`.
///
/// Both policies are monotonically non-increasing in distance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Calibration {
    /// `clamp(100 · (1 − d / d_max), 0, 100)`.
    Linear { d_max: f64 },
    /// `100 · exp(−k · min(d, cap))`.
    Exponential { k: f64, cap: f64 },
}

impl Default for Calibration {
    fn default() -> Self {
        Calibration::Linear { d_max: 100.0 }
    }
}

impl Calibration {
    pub fn confidence(&self, distance: f64) -> f64 {
        let d = distance.max(0.0);
        match *self {
            Calibration::Linear { d_max } => (100.0 * (1.0 - d / d_max)).clamp(0.0, 100.0),
            Calibration::Exponential { k, cap } => {
                (100.0 * (-k * d.min(cap)).exp()).clamp(0.0, 100.0)
            }
        }
    }
}

/// Maximum accepted distance, fixed or scaled by face area.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThresholdPolicy {
    Static {
        max_distance: f64,
    },
    /// `base · clamp(area / reference_area, min_factor, max_factor)`.
    ///
    /// Larger faces carry more texture and are allowed a looser threshold.
    Adaptive {
        base: f64,
        reference_area: f64,
        min_factor: f64,
        max_factor: f64,
    },
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        ThresholdPolicy::Adaptive {
            base: 75.0,
            reference_area: 200.0 * 200.0,
            min_factor: 0.8,
            max_factor: 1.2,
        }
    }
}

impl ThresholdPolicy {
    pub fn threshold_for(&self, face: &BoundingBox) -> f64 {
        match *self {
            ThresholdPolicy::Static { max_distance } => max_distance,
            ThresholdPolicy::Adaptive {
                base,
                reference_area,
                min_factor,
                max_factor,
            } => {
                let factor = (face.area() as f64 / reference_area).clamp(min_factor, max_factor);
                base * factor
            }
        }
    }

    /// Accept iff `distance` is strictly below the threshold for this box.
    pub fn accepts(&self, distance: f64, face: &BoundingBox) -> bool {
        distance < self.threshold_for(face)
    }
}

/// Confidence reported alongside a rejected ("Unknown") decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownConfidence {
    #[default]
    Zero,
    /// `100 − confidence`: how sure we are the face is *not* enrolled.
    Inverted,
}

impl UnknownConfidence {
    pub fn apply(&self, confidence: f64) -> f64 {
        match self {
            UnknownConfidence::Zero => 0.0,
            UnknownConfidence::Inverted => 100.0 - confidence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchQuality {
    Excellent,
    Good,
    Fair,
    NoMatch,
}

impl MatchQuality {
    pub fn classify(distance: f64, accepted: bool) -> Self {
        if !accepted {
            MatchQuality::NoMatch
        } else if distance < 50.0 {
            MatchQuality::Excellent
        } else if distance < 65.0 {
            MatchQuality::Good
        } else {
            MatchQuality::Fair
        }
    }
}

/// The full decision policy handed to a recognizer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionPolicy {
    pub calibration: Calibration,
    pub threshold: ThresholdPolicy,
    pub unknown_confidence: UnknownConfidence,
}

/// Outcome of applying a [`DecisionPolicy`] to one distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub accepted: bool,
    pub confidence: f64,
    pub threshold: f64,
    pub quality: MatchQuality,
}

impl DecisionPolicy {
    pub fn decide(&self, distance: f64, face: &BoundingBox) -> Verdict {
        let confidence = self.calibration.confidence(distance);
        let threshold = self.threshold.threshold_for(face);
        let accepted = distance < threshold;
        Verdict {
            accepted,
            confidence: if accepted {
                confidence
            } else {
                self.unknown_confidence.apply(confidence)
            },
            threshold,
            quality: MatchQuality::classify(distance, accepted),
        }
    }
}
