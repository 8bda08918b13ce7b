//! Sequential live recognition loop: read → detect → decide → mark.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use image::GrayImage;
use serde::Serialize;
use thiserror::Error;

use crate::attendance::AttendanceLedger;
use crate::error::{ErrorKind, Result};
use crate::lbph::{LbphRecognizer, TextureClassifier};
use crate::recognition::{Recognition, Recognizer};

/// A grayscale frame from a live source.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub image: GrayImage,
    pub sequence: u32,
    /// Set by the source when the frame is too dark to be useful.
    pub is_dark: bool,
}

#[derive(Error, Debug)]
#[error("frame source: {0}")]
pub struct FrameSourceError(pub String);

pub trait FrameSource {
    fn next_frame(&mut self) -> std::result::Result<CapturedFrame, FrameSourceError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum EndReason {
    Cancelled,
    FrameLimit,
    SourceFailed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveSummary {
    pub frames: usize,
    pub dark_frames: usize,
    pub faces: usize,
    pub recognized: usize,
    pub unknown: usize,
    pub frame_errors: usize,
    pub end: EndReason,
}

pub struct LiveSession<C = LbphRecognizer> {
    recognizer: Recognizer<C>,
    ledger: AttendanceLedger,
    cancel: Arc<AtomicBool>,
    max_frames: Option<usize>,
}

impl<C: TextureClassifier> LiveSession<C> {
    pub fn new(
        recognizer: Recognizer<C>,
        ledger: AttendanceLedger,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            recognizer,
            ledger,
            cancel,
            max_frames: None,
        }
    }

    /// Stop after this many frames (dark ones included).
    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = Some(max_frames);
        self
    }

    pub fn ledger(&self) -> &AttendanceLedger {
        &self.ledger
    }

    pub fn into_ledger(self) -> AttendanceLedger {
        self.ledger
    }

    /// Run until cancelled, the frame limit is hit, or a read fails.
    ///
    /// `on_frame` sees every decision batch, for rendering. Per-frame
    /// failures are logged and counted; a checkpoint mismatch aborts.
    pub fn run(
        &mut self,
        source: &mut dyn FrameSource,
        mut on_frame: impl FnMut(u32, &[Recognition]),
    ) -> Result<LiveSummary> {
        let mut summary = LiveSummary {
            frames: 0,
            dark_frames: 0,
            faces: 0,
            recognized: 0,
            unknown: 0,
            frame_errors: 0,
            end: EndReason::Cancelled,
        };

        loop {
            if self.cancel.load(Ordering::Relaxed) {
                summary.end = EndReason::Cancelled;
                break;
            }
            if self.max_frames.is_some_and(|max| summary.frames >= max) {
                summary.end = EndReason::FrameLimit;
                break;
            }

            let frame = match source.next_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(error = %e, "frame read failed, ending session");
                    summary.end = EndReason::SourceFailed(e.to_string());
                    break;
                }
            };
            summary.frames += 1;

            if frame.is_dark {
                summary.dark_frames += 1;
                tracing::debug!(seq = frame.sequence, "skipping dark frame");
                continue;
            }

            let decisions = match self.recognizer.recognize_frame(&frame.image) {
                Ok(decisions) => decisions,
                Err(e) if e.kind() == ErrorKind::CheckpointMismatch => return Err(e),
                Err(e) => {
                    summary.frame_errors += 1;
                    tracing::warn!(seq = frame.sequence, error = %e, "frame recognition failed");
                    continue;
                }
            };

            summary.faces += decisions.len();
            let now = Utc::now();
            for decision in &decisions {
                if decision.accepted {
                    summary.recognized += 1;
                    self.ledger.mark_present(&decision.identity, decision.confidence, now);
                } else {
                    summary.unknown += 1;
                }
            }
            on_frame(frame.sequence, &decisions);
        }

        tracing::info!(
            frames = summary.frames,
            faces = summary.faces,
            recognized = summary.recognized,
            present = self.ledger.present().count(),
            "live session ended"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoint;
    use crate::config::Config;
    use crate::detector::{DetectionParams, DetectorError, FaceLocator};
    use crate::error::Error;
    use crate::lbph::{ClassifierError, LbphParams};
    use crate::preprocess::Preprocessor;
    use crate::registry::LabelRegistry;
    use crate::types::{BoundingBox, FaceSample, Prediction, FACE_SIZE};
    use image::Luma;
    use std::collections::VecDeque;

    struct CenterLocator;

    impl FaceLocator for CenterLocator {
        fn detect(
            &mut self,
            image: &GrayImage,
            _: &DetectionParams,
        ) -> std::result::Result<Vec<BoundingBox>, DetectorError> {
            Ok(vec![BoundingBox::new(0, 0, image.width(), image.height())])
        }
    }

    struct ScriptedSource(VecDeque<CapturedFrame>);

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> std::result::Result<CapturedFrame, FrameSourceError> {
            self.0.pop_front().ok_or_else(|| FrameSourceError("device unplugged".into()))
        }
    }

    fn face() -> GrayImage {
        GrayImage::from_fn(FACE_SIZE, FACE_SIZE, |x, y| {
            Luma([((x / 10 + y / 10) % 2 * 200 + 20) as u8])
        })
    }

    fn frame(sequence: u32, is_dark: bool) -> CapturedFrame {
        CapturedFrame {
            image: face(),
            sequence,
            is_dark,
        }
    }

    fn session(config: &Config) -> LiveSession {
        let mut registry = LabelRegistry::new();
        let label = registry.assign("alice");
        let preprocessor = Preprocessor::new(config.normalization);
        let prepared = preprocessor.normalize(face());
        let sample = preprocessor
            .face_sample(&prepared, &BoundingBox::new(0, 0, FACE_SIZE, FACE_SIZE))
            .unwrap();
        let mut model = LbphRecognizer::new(LbphParams::default()).unwrap();
        model.train(&[sample], &[label]).unwrap();
        let checkpoint = Arc::new(Checkpoint::new(model, registry));
        let recognizer = Recognizer::new(checkpoint, Box::new(CenterLocator), config);
        let ledger = AttendanceLedger::new("test", Utc::now());
        LiveSession::new(recognizer, ledger, Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn test_read_failure_ends_session_and_marks_present() {
        let config = Config::default();
        let mut live = session(&config);
        let frames = [frame(0, false), frame(1, true), frame(2, false)];
        let mut source = ScriptedSource(VecDeque::from(frames));
        let mut rendered = Vec::new();
        let summary = live.run(&mut source, |seq, d| rendered.push((seq, d.len()))).unwrap();

        assert_eq!(summary.frames, 3);
        assert_eq!(summary.dark_frames, 1);
        assert_eq!(summary.recognized, 2);
        assert_eq!(summary.end, EndReason::SourceFailed("frame source: device unplugged".into()));
        assert_eq!(rendered, vec![(0, 1), (2, 1)]);
        assert_eq!(live.ledger().present().collect::<Vec<_>>(), vec!["alice"]);
    }

    #[test]
    fn test_cancel_stops_before_reading() {
        let mut live = session(&Config::default());
        live.cancel.store(true, Ordering::Relaxed);
        let mut source = ScriptedSource(VecDeque::from([frame(0, false)]));
        let summary = live.run(&mut source, |_, _| {}).unwrap();
        assert_eq!(summary.end, EndReason::Cancelled);
        assert_eq!(summary.frames, 0);
    }

    #[test]
    fn test_frame_limit() {
        let mut live = session(&Config::default()).with_max_frames(1);
        let mut source = ScriptedSource(VecDeque::from([frame(0, true), frame(1, false)]));
        let summary = live.run(&mut source, |_, _| {}).unwrap();
        assert_eq!(summary.end, EndReason::FrameLimit);
        assert_eq!(summary.frames, 1);
    }

    #[test]
    fn test_mismatch_aborts_session() {
        struct Stray;
        impl TextureClassifier for Stray {
            fn train(
                &mut self,
                _: &[FaceSample],
                _: &[u32],
            ) -> std::result::Result<(), ClassifierError> {
                Ok(())
            }
            fn predict(&self, _: &FaceSample) -> std::result::Result<Prediction, ClassifierError> {
                Ok(Prediction { label: 9, distance: 1.0 })
            }
            fn save(&self, _: &mut dyn std::io::Write) -> std::result::Result<(), ClassifierError> {
                Ok(())
            }
            fn load(_: &mut dyn std::io::Read) -> std::result::Result<Self, ClassifierError> {
                Ok(Stray)
            }
        }

        let config = Config::default();
        let checkpoint = Arc::new(Checkpoint::new(Stray, LabelRegistry::new()));
        let recognizer = Recognizer::new(checkpoint, Box::new(CenterLocator), &config);
        let ledger = AttendanceLedger::new("t", Utc::now());
        let mut live = LiveSession::new(recognizer, ledger, Arc::new(AtomicBool::new(false)));
        let mut source = ScriptedSource(VecDeque::from([frame(0, false)]));
        let err = live.run(&mut source, |_, _| {}).unwrap_err();
        assert!(matches!(err, Error::CheckpointMismatch(9)));
    }
}
