//! Pipeline configuration.
//!
//! Built-in defaults, then an optional TOML file, then `ROLLCALL_*`
//! environment overrides for the knobs people change most.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::augment::{Augmenter, DEFAULT_PROBE_ANGLES};
use crate::corpus::CorpusLayout;
use crate::decision::{Calibration, DecisionPolicy, ThresholdPolicy};
use crate::detector::{DetectionParams, Extent};
use crate::lbph::LbphParams;
use crate::preprocess::Normalization;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Paths {
    /// Raw enrollment photos, one directory per identity.
    pub students_dir: PathBuf,
    /// Curated corpus written by the validator and read by training.
    pub validated_dir: PathBuf,
    pub model_dir: PathBuf,
    /// Checkpoint stem: `<model_dir>/<model_name>.lbph.json` + `_labels.toml`.
    pub model_name: String,
    /// SCRFD `det_10g.onnx`.
    pub locator_model: PathBuf,
    /// Where recognition debug images go.
    pub debug_dir: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            students_dir: PathBuf::from("students"),
            validated_dir: PathBuf::from("validated_faces"),
            model_dir: PathBuf::from("models"),
            model_name: "face_recognizer".to_string(),
            locator_model: PathBuf::from("models/det_10g.onnx"),
            debug_dir: PathBuf::from("debug"),
        }
    }
}

/// Detection parameters per pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub enrollment: DetectionParams,
    pub training: DetectionParams,
    pub recognition: DetectionParams,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            enrollment: DetectionParams::ENROLLMENT,
            training: DetectionParams {
                scale_factor: 1.1,
                min_neighbors: 5,
                min_size: Extent::square(50),
                max_size: Extent::square(300),
            },
            recognition: DetectionParams {
                scale_factor: 1.1,
                min_neighbors: 3,
                min_size: Extent::square(30),
                max_size: Extent::square(300),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// V4L2 device path.
    pub camera_device: String,
    /// Frames discarded at startup while exposure settles.
    pub warmup_frames: usize,
    /// Fraction of near-black pixels above which a frame is skipped.
    pub dark_threshold: f32,
    /// Attendance ledger written when the session ends.
    pub attendance_path: PathBuf,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            warmup_frames: 4,
            dark_threshold: 0.95,
            attendance_path: PathBuf::from("attendance.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: Paths,
    pub corpus: CorpusLayout,
    pub detection: DetectionConfig,
    pub normalization: Normalization,
    pub augmentation: Augmenter,
    pub lbph: LbphParams,
    pub decision: DecisionPolicy,
    /// Rotations tried per face at recognition time; 0 is the crop itself.
    pub probe_angles: Vec<f32>,
    /// Photo-level worker threads for validation and training.
    pub workers: usize,
    /// Write annotated `debug_*` images next to processed photos.
    pub debug_images: bool,
    pub live: LiveConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: Paths::default(),
            corpus: CorpusLayout::default(),
            detection: DetectionConfig::default(),
            normalization: Normalization::default(),
            augmentation: Augmenter::default(),
            lbph: LbphParams::default(),
            decision: DecisionPolicy::default(),
            probe_angles: DEFAULT_PROBE_ANGLES.to_vec(),
            workers: std::thread::available_parallelism().map_or(4, |n| n.get().min(8)),
            debug_images: false,
            live: LiveConfig::default(),
        }
    }
}

impl Config {
    /// Defaults → TOML file (`path`, else `ROLLCALL_CONFIG`) → env overrides → validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("ROLLCALL_CONFIG").ok().map(PathBuf::from));

        let mut config = match file {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    /// Apply `ROLLCALL_*` overrides from `lookup`; unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let path = |key: &str| lookup(key).map(PathBuf::from);

        if let Some(v) = path("ROLLCALL_STUDENTS_DIR") {
            self.paths.students_dir = v;
        }
        if let Some(v) = path("ROLLCALL_VALIDATED_DIR") {
            self.paths.validated_dir = v;
        }
        if let Some(v) = path("ROLLCALL_MODEL_DIR") {
            self.paths.model_dir = v;
        }
        if let Some(v) = lookup("ROLLCALL_MODEL_NAME") {
            self.paths.model_name = v;
        }
        if let Some(v) = path("ROLLCALL_LOCATOR_MODEL") {
            self.paths.locator_model = v;
        }
        if let Some(v) = parsed::<f64>(&lookup, "ROLLCALL_THRESHOLD") {
            match &mut self.decision.threshold {
                ThresholdPolicy::Static { max_distance } => *max_distance = v,
                ThresholdPolicy::Adaptive { base, .. } => *base = v,
            }
        }
        if let Some(v) = parsed::<usize>(&lookup, "ROLLCALL_WORKERS") {
            self.workers = v;
        }
        if let Some(v) = lookup("ROLLCALL_DEBUG_IMAGES").and_then(|v| parse_flag(&v)) {
            self.debug_images = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (stage, params) in [
            ("enrollment", &self.detection.enrollment),
            ("training", &self.detection.training),
            ("recognition", &self.detection.recognition),
        ] {
            if params.scale_factor <= 1.0 {
                return Err(invalid(format!("{stage} scale_factor must be > 1.0")));
            }
            if params.min_size.width > params.max_size.width
                || params.min_size.height > params.max_size.height
            {
                return Err(invalid(format!("{stage} min_size exceeds max_size")));
            }
        }

        match self.decision.calibration {
            Calibration::Linear { d_max } => positive("calibration d_max", d_max)?,
            Calibration::Exponential { k, cap } => {
                positive("calibration k", k)?;
                positive("calibration cap", cap)?;
            }
        }

        match self.decision.threshold {
            ThresholdPolicy::Static { max_distance } => {
                positive("threshold max_distance", max_distance)?
            }
            ThresholdPolicy::Adaptive {
                base,
                reference_area,
                min_factor,
                max_factor,
            } => {
                positive("adaptive threshold base", base)?;
                positive("adaptive threshold reference_area", reference_area)?;
                positive("adaptive threshold min_factor", min_factor)?;
                positive("adaptive threshold max_factor", max_factor)?;
                if min_factor > max_factor {
                    return Err(invalid("adaptive threshold needs min_factor <= max_factor"));
                }
            }
        }

        self.lbph.validate().map_err(|e| invalid(e.to_string()))?;

        if self.workers == 0 {
            return Err(invalid("workers must be >= 1"));
        }
        if self.probe_angles.is_empty() {
            return Err(invalid("probe_angles must not be empty"));
        }
        if self.paths.model_name.is_empty() {
            return Err(invalid("model_name must not be empty"));
        }
        Ok(())
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.paths.model_dir
    }
}

/// `1/true/yes/on` or `0/false/no/off`, case-insensitive.
fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.parse().ok())
}

/// Finite and strictly positive; NaN fails too.
fn positive(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(format!("{name} must be a finite positive number, got {value}")))
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.detection.enrollment, DetectionParams::ENROLLMENT);
        assert_eq!(config.probe_angles, vec![0.0, -5.0, 5.0]);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(env(&[
            ("ROLLCALL_MODEL_DIR", "/var/lib/rollcall"),
            ("ROLLCALL_THRESHOLD", "68.5"),
            ("ROLLCALL_WORKERS", "2"),
            ("ROLLCALL_DEBUG_IMAGES", "1"),
        ]));
        assert_eq!(config.paths.model_dir, PathBuf::from("/var/lib/rollcall"));
        assert_eq!(config.workers, 2);
        assert!(config.debug_images);
        assert!(matches!(
            config.decision.threshold,
            ThresholdPolicy::Adaptive { base, .. } if base == 68.5
        ));
    }

    #[test]
    fn test_unparseable_override_ignored() {
        let mut config = Config::default();
        let workers = config.workers;
        config.apply_overrides(env(&[("ROLLCALL_WORKERS", "lots")]));
        assert_eq!(config.workers, workers);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            workers = 3
            [paths]
            model_name = "cs101"
            [decision.threshold]
            kind = "static"
            max_distance = 70.0
            "#,
        )
        .unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.paths.model_name, "cs101");
        assert_eq!(config.paths.students_dir, PathBuf::from("students"));
        assert_eq!(config.decision.threshold, ThresholdPolicy::Static { max_distance: 70.0 });
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.detection.training.scale_factor = 1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.detection.recognition.min_size = Extent::square(500);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.workers = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.decision.threshold = ThresholdPolicy::Adaptive {
            base: 75.0,
            reference_area: 40_000.0,
            min_factor: 1.5,
            max_factor: 1.2,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_degenerate_calibration() {
        for calibration in [
            Calibration::Linear { d_max: 0.0 },
            Calibration::Linear { d_max: f64::NAN },
            Calibration::Exponential { k: -0.1, cap: 200.0 },
            Calibration::Exponential { k: 0.02, cap: 0.0 },
            Calibration::Exponential { k: f64::INFINITY, cap: 200.0 },
        ] {
            let mut config = Config::default();
            config.decision.calibration = calibration;
            assert!(config.validate().is_err(), "{calibration:?} accepted");
        }
    }

    #[test]
    fn test_validate_rejects_non_finite_thresholds() {
        let mut config = Config::default();
        config.decision.threshold = ThresholdPolicy::Static { max_distance: f64::NAN };
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.decision.threshold = ThresholdPolicy::Static { max_distance: f64::INFINITY };
        assert!(config.validate().is_err());

        let adaptive = |base: f64, reference_area: f64, min_factor: f64, max_factor: f64| {
            let mut config = Config::default();
            config.decision.threshold = ThresholdPolicy::Adaptive {
                base,
                reference_area,
                min_factor,
                max_factor,
            };
            config.validate()
        };
        assert!(adaptive(75.0, 40_000.0, 0.8, 1.2).is_ok());
        assert!(adaptive(f64::NAN, 40_000.0, 0.8, 1.2).is_err());
        assert!(adaptive(75.0, f64::NAN, 0.8, 1.2).is_err());
        assert!(adaptive(75.0, 40_000.0, f64::NAN, 1.2).is_err());
        assert!(adaptive(75.0, 40_000.0, 0.8, f64::INFINITY).is_err());
        assert!(adaptive(75.0, 40_000.0, 0.0, 1.2).is_err());
    }

    #[test]
    fn test_nan_threshold_override_fails_validation() {
        let mut config = Config::default();
        config.apply_overrides(env(&[("ROLLCALL_THRESHOLD", "NaN")]));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_images_flag_spellings() {
        let spellings = [
            ("1", true),
            ("true", true),
            ("Yes", true),
            ("0", false),
            ("false", false),
            ("no", false),
        ];
        for (value, expected) in spellings {
            let mut config = Config {
                debug_images: !expected,
                ..Config::default()
            };
            config.apply_overrides(env(&[("ROLLCALL_DEBUG_IMAGES", value)]));
            assert_eq!(config.debug_images, expected, "ROLLCALL_DEBUG_IMAGES={value}");
        }

        let mut config = Config::default();
        config.apply_overrides(env(&[("ROLLCALL_DEBUG_IMAGES", "maybe")]));
        assert!(!config.debug_images);
    }

    #[test]
    fn test_from_file_missing() {
        let err = Config::from_file(Path::new("/nonexistent/rollcall.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
