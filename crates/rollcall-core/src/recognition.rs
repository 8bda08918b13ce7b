//! Recognition decisions: locate, crop, probe, calibrate, threshold, resolve.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::{DynamicImage, GrayImage};
use serde::Serialize;

use crate::augment;
use crate::checkpoint::Checkpoint;
use crate::config::Config;
use crate::corpus::file_name;
use crate::debug::{self, Annotation};
use crate::decision::{DecisionPolicy, MatchQuality};
use crate::detector::{DetectionParams, FaceLocator};
use crate::error::{Error, Result};
use crate::lbph::{LbphRecognizer, TextureClassifier};
use crate::preprocess::{load_image, Preprocessor};
use crate::types::{largest_box, BoundingBox, Identity, Label, Prediction, UNKNOWN_IDENTITY};

/// One decision for one face box.
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    /// Resolved identity, or `"Unknown"` when rejected.
    pub identity: Identity,
    pub accepted: bool,
    pub confidence: f64,
    pub face: BoundingBox,
    pub distance: f64,
    pub label: Label,
    pub threshold: f64,
    pub quality: MatchQuality,
}

/// Wire record for one recognition attempt. Failures carry only
/// `success` and `message`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionRecord {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicted_identity: Option<Identity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_location: Option<BoundingBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_quality: Option<MatchQuality>,
    pub message: String,
}

impl RecognitionRecord {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            predicted_identity: None,
            confidence: None,
            face_location: None,
            distance: None,
            match_quality: None,
            message: message.into(),
        }
    }
}

impl From<&Recognition> for RecognitionRecord {
    fn from(r: &Recognition) -> Self {
        let message = if r.accepted {
            format!("Face recognized as {}", r.identity)
        } else {
            "Face not recognized".to_string()
        };
        Self {
            success: true,
            predicted_identity: Some(r.identity.clone()),
            confidence: Some(round2(r.confidence)),
            face_location: Some(r.face),
            distance: Some(round2(r.distance)),
            match_quality: Some(r.quality),
            message,
        }
    }
}

impl From<&Result<Recognition>> for RecognitionRecord {
    fn from(result: &Result<Recognition>) -> Self {
        match result {
            Ok(r) => r.into(),
            Err(e) => RecognitionRecord::failure(e.to_string()),
        }
    }
}

/// Wire record for the face detection check. `faces` lists every box the
/// locator reported; `face_location` is the largest of them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionRecord {
    pub success: bool,
    pub face_detected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_location: Option<BoundingBox>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub faces: Vec<BoundingBox>,
    pub message: String,
}

impl DetectionRecord {
    fn failure(message: String) -> Self {
        Self {
            success: false,
            face_detected: false,
            face_location: None,
            faces: Vec::new(),
            message,
        }
    }
}

impl From<&Result<Vec<BoundingBox>>> for DetectionRecord {
    fn from(result: &Result<Vec<BoundingBox>>) -> Self {
        match result {
            Ok(faces) if faces.is_empty() => Self::failure(Error::NoFaceDetected.to_string()),
            Ok(faces) => Self {
                success: true,
                face_detected: true,
                face_location: largest_box(faces),
                faces: faces.clone(),
                message: match faces.len() {
                    1 => "Face detected".to_string(),
                    n => format!("{n} faces detected"),
                },
            },
            Err(e) => Self::failure(e.to_string()),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Owns one locator; shares the checkpoint.
pub struct Recognizer<C = LbphRecognizer> {
    checkpoint: Arc<Checkpoint<C>>,
    locator: Box<dyn FaceLocator>,
    params: DetectionParams,
    preprocessor: Preprocessor,
    policy: DecisionPolicy,
    probe_angles: Vec<f32>,
    debug_dir: Option<PathBuf>,
}

impl<C: TextureClassifier> Recognizer<C> {
    pub fn new(
        checkpoint: Arc<Checkpoint<C>>,
        locator: Box<dyn FaceLocator>,
        config: &Config,
    ) -> Self {
        Self {
            checkpoint,
            locator,
            params: config.detection.recognition,
            preprocessor: Preprocessor::new(config.normalization),
            policy: config.decision,
            probe_angles: config.probe_angles.clone(),
            debug_dir: config.debug_images.then(|| config.paths.debug_dir.clone()),
        }
    }

    pub fn policy(&self) -> &DecisionPolicy {
        &self.policy
    }

    pub fn checkpoint(&self) -> &Arc<Checkpoint<C>> {
        &self.checkpoint
    }

    /// Recognize the largest face in a photo on disk.
    pub fn recognize_path(&mut self, path: &Path) -> Result<Recognition> {
        let image = load_image(path)?;
        let recognition = self.recognize(&image)?;
        if let Some(dir) = &self.debug_dir {
            let dest = dir.join(format!("debug_recognition_{}", file_name(path)));
            let annotation = Annotation::Recognition {
                face: recognition.face,
                accepted: recognition.accepted,
                confidence: recognition.confidence,
            };
            let written = std::fs::create_dir_all(dir)
                .map_err(|e| Error::io(dir, e))
                .and_then(|_| debug::emit(&image, annotation, &dest));
            if let Err(e) = written {
                tracing::warn!(path = %dest.display(), error = %e, "failed to write debug image");
            }
        }
        Ok(recognition)
    }

    /// Largest face wins; ties keep the first box reported.
    pub fn recognize(&mut self, image: &DynamicImage) -> Result<Recognition> {
        let gray = self.preprocessor.prepare(image);
        let faces = self.locate(&gray)?;
        let face = largest_box(&faces).ok_or(Error::NoFaceDetected)?;
        self.decide(&gray, face)
    }

    /// One independent decision per detected face.
    pub fn recognize_all(&mut self, image: &DynamicImage) -> Result<Vec<Recognition>> {
        let gray = self.preprocessor.prepare(image);
        self.decide_all(&gray)
    }

    /// Like [`recognize_all`](Self::recognize_all) for an already-gray frame.
    pub fn recognize_frame(&mut self, frame: &GrayImage) -> Result<Vec<Recognition>> {
        let gray = self.preprocessor.normalize(frame.clone());
        self.decide_all(&gray)
    }

    /// Every face location, without classification.
    pub fn locate_all(&mut self, image: &DynamicImage) -> Result<Vec<BoundingBox>> {
        let gray = self.preprocessor.prepare(image);
        self.locate(&gray)
    }

    fn locate(&mut self, gray: &GrayImage) -> Result<Vec<BoundingBox>> {
        let faces = self.locator.detect(gray, &self.params)?;
        tracing::debug!(faces = faces.len(), "faces located");
        Ok(faces)
    }

    fn decide_all(&mut self, gray: &GrayImage) -> Result<Vec<Recognition>> {
        let faces = self.locate(gray)?;
        faces.into_iter().map(|face| self.decide(gray, face)).collect()
    }

    /// Best-of-probes prediction for one box, then the policy decision.
    ///
    /// The label is resolved before accept/reject so a registry that does
    /// not match the classifier always surfaces as `CheckpointMismatch`.
    fn decide(&self, gray: &GrayImage, face: BoundingBox) -> Result<Recognition> {
        let sample = self.preprocessor.face_sample(gray, &face)?;

        let mut best: Option<Prediction> = None;
        for probe in augment::probes(&sample, &self.probe_angles) {
            let prediction = self.checkpoint.predict(&probe)?;
            if best.map_or(true, |b| prediction.distance < b.distance) {
                best = Some(prediction);
            }
        }
        let best = best.ok_or(Error::NoFaceDetected)?;

        let resolved = self.checkpoint.registry().reverse_lookup(best.label)?;
        let verdict = self.policy.decide(best.distance, &face);
        let identity = if verdict.accepted {
            resolved.to_string()
        } else {
            UNKNOWN_IDENTITY.to_string()
        };

        tracing::debug!(
            identity = %identity,
            distance = best.distance,
            threshold = verdict.threshold,
            confidence = verdict.confidence,
            "face decided"
        );
        Ok(Recognition {
            identity,
            accepted: verdict.accepted,
            confidence: verdict.confidence,
            face,
            distance: best.distance,
            label: best.label,
            threshold: verdict.threshold,
            quality: verdict.quality,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectorError;
    use crate::lbph::ClassifierError;
    use crate::registry::LabelRegistry;
    use crate::types::FaceSample;
    use std::io::{Read, Write};

    struct FixedLocator(Vec<BoundingBox>);

    impl FaceLocator for FixedLocator {
        fn detect(
            &mut self,
            _: &GrayImage,
            _: &DetectionParams,
        ) -> std::result::Result<Vec<BoundingBox>, DetectorError> {
            Ok(self.0.clone())
        }
    }

    /// Distance = 100 minus the number of pure-black pixels, so rotated
    /// probes (black corners) beat the unrotated crop.
    struct BlackPixelClassifier(Label);

    impl TextureClassifier for BlackPixelClassifier {
        fn train(
            &mut self,
            _: &[FaceSample],
            _: &[Label],
        ) -> std::result::Result<(), ClassifierError> {
            Ok(())
        }

        fn predict(&self, sample: &FaceSample) -> std::result::Result<Prediction, ClassifierError> {
            let black = sample.image().iter().filter(|&&p| p == 0).count() as f64;
            Ok(Prediction {
                label: self.0,
                distance: (100.0 - black).max(0.0),
            })
        }

        fn save(&self, _: &mut dyn Write) -> std::result::Result<(), ClassifierError> {
            Ok(())
        }

        fn load(_: &mut dyn Read) -> std::result::Result<Self, ClassifierError> {
            Ok(Self(0))
        }
    }

    fn recognizer(
        label: Label,
        faces: Vec<BoundingBox>,
        registry: LabelRegistry,
    ) -> Recognizer<BlackPixelClassifier> {
        let checkpoint = Arc::new(Checkpoint::new(BlackPixelClassifier(label), registry));
        Recognizer::new(checkpoint, Box::new(FixedLocator(faces)), &Config::default())
    }

    fn registry(ids: &[&str]) -> LabelRegistry {
        let mut reg = LabelRegistry::new();
        for id in ids {
            reg.assign(id);
        }
        reg
    }

    fn photo() -> DynamicImage {
        // Two flat halves: after equalization the darker half stays well above 0.
        DynamicImage::ImageLuma8(GrayImage::from_fn(400, 400, |x, _| {
            image::Luma([if x < 150 { 60 } else { 180 }])
        }))
    }

    #[test]
    fn test_no_face_record() {
        let mut r = recognizer(0, Vec::new(), registry(&["alice"]));
        let result = r.recognize(&photo());
        assert!(matches!(result, Err(Error::NoFaceDetected)));

        let json = serde_json::to_value(RecognitionRecord::from(&result)).unwrap();
        assert_eq!(json["success"], false);
        assert!(json["message"].as_str().unwrap().starts_with("No face detected"));
        assert!(json.get("face_location").is_none());
        assert!(json.get("predicted_identity").is_none());
    }

    #[test]
    fn test_largest_face_is_recognized() {
        let faces = vec![BoundingBox::new(0, 0, 50, 50), BoundingBox::new(10, 10, 60, 60)];
        let mut r = recognizer(0, faces, registry(&["alice"]));
        let rec = r.recognize(&photo()).unwrap();
        assert_eq!(rec.face, BoundingBox::new(10, 10, 60, 60));
    }

    #[test]
    fn test_missing_label_is_checkpoint_mismatch() {
        let mut r = recognizer(7, vec![BoundingBox::new(50, 50, 200, 200)], registry(&["a", "b"]));
        let err = r.recognize(&photo()).unwrap_err();
        assert!(matches!(err, Error::CheckpointMismatch(7)));
    }

    #[test]
    fn test_rotated_probe_can_win() {
        let mut r = recognizer(0, vec![BoundingBox::new(50, 50, 200, 200)], registry(&["alice"]));
        let rec = r.recognize(&photo()).unwrap();
        assert!(rec.distance < 100.0, "unrotated crop won: {}", rec.distance);
        assert!(rec.accepted);
        assert_eq!(rec.identity, "alice");
    }

    #[test]
    fn test_single_probe_uses_crop_only() {
        let checkpoint = Arc::new(Checkpoint::new(BlackPixelClassifier(0), registry(&["alice"])));
        let config = Config {
            probe_angles: vec![0.0],
            ..Config::default()
        };
        let locator = FixedLocator(vec![BoundingBox::new(50, 50, 200, 200)]);
        let mut r = Recognizer::new(checkpoint, Box::new(locator), &config);
        let rec = r.recognize(&photo()).unwrap();
        // Equalized crops contain no pure-black pixels.
        assert_eq!(rec.distance, 100.0);
        assert!(!rec.accepted);
        assert_eq!(rec.identity, UNKNOWN_IDENTITY);
        assert_eq!(rec.confidence, 0.0);
        assert_eq!(rec.quality, MatchQuality::NoMatch);
    }

    #[test]
    fn test_recognize_all_decides_each_box() {
        let faces = vec![BoundingBox::new(0, 0, 100, 100), BoundingBox::new(200, 200, 120, 120)];
        let mut r = recognizer(0, faces.clone(), registry(&["alice"]));
        let all = r.recognize_all(&photo()).unwrap();
        assert_eq!(all.iter().map(|d| d.face).collect::<Vec<_>>(), faces);
    }

    #[test]
    fn test_success_record_fields() {
        let rec = Recognition {
            identity: "alice".into(),
            accepted: true,
            confidence: 61.234,
            face: BoundingBox::new(1, 2, 3, 4),
            distance: 38.766,
            label: 0,
            threshold: 75.0,
            quality: MatchQuality::Excellent,
        };
        let json = serde_json::to_value(RecognitionRecord::from(&rec)).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["predicted_identity"], "alice");
        assert_eq!(json["confidence"], 61.23);
        assert_eq!(json["match_quality"], "excellent");
        assert_eq!(json["face_location"]["width"], 3);
    }

    #[test]
    fn test_detection_record() {
        let found: Result<Vec<BoundingBox>> = Ok(vec![BoundingBox::new(1, 1, 40, 40)]);
        let record = DetectionRecord::from(&found);
        assert!(record.success);
        assert!(record.face_detected);
        assert_eq!(record.face_location, Some(BoundingBox::new(1, 1, 40, 40)));
        assert_eq!(record.message, "Face detected");

        let none: Result<Vec<BoundingBox>> = Ok(Vec::new());
        let json = serde_json::to_value(DetectionRecord::from(&none)).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["face_detected"], false);
        assert_eq!(json["message"], "No face detected in image");
        assert!(json.get("face_location").is_none());
        assert!(json.get("faces").is_none());

        let failed: Result<Vec<BoundingBox>> =
            Err(Error::LocatorUnavailable("model missing".into()));
        let record = DetectionRecord::from(&failed);
        assert!(!record.success);
        assert!(record.faces.is_empty());
    }

    #[test]
    fn test_detection_record_lists_every_face() {
        let boxes = vec![
            BoundingBox::new(0, 0, 30, 30),
            BoundingBox::new(50, 50, 80, 80),
            BoundingBox::new(200, 10, 40, 40),
        ];
        let found: Result<Vec<BoundingBox>> = Ok(boxes.clone());
        let json = serde_json::to_value(DetectionRecord::from(&found)).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["message"], "3 faces detected");
        assert_eq!(json["faces"].as_array().unwrap().len(), 3);
        assert_eq!(json["faces"][2]["x"], 200);
        assert_eq!(json["face_location"]["width"], 80);
    }

    #[test]
    fn test_locate_all_reports_every_box() {
        let boxes = vec![BoundingBox::new(5, 5, 40, 40), BoundingBox::new(60, 60, 30, 30)];
        let mut r = recognizer(0, boxes.clone(), registry(&["alice"]));
        assert_eq!(r.locate_all(&photo()).unwrap(), boxes);
    }
}
