//! rollcall-core: Enrollment curation, LBPH training and recognition decisions.
//!
//! Faces are located with SCRFD (ONNX Runtime) and classified with a local
//! binary pattern histogram nearest-neighbor model. Both sit behind traits;
//! everything else here is the curation and decision pipeline around them.

pub mod attendance;
pub mod augment;
pub mod checkpoint;
pub mod config;
pub mod corpus;
pub mod debug;
pub mod decision;
pub mod detector;
pub mod error;
pub mod lbph;
pub mod live;
pub mod preprocess;
pub mod recognition;
pub mod registry;
pub mod trainer;
pub mod types;
pub mod validator;
pub mod workers;

pub use checkpoint::{Checkpoint, CheckpointPaths};
pub use config::Config;
pub use decision::{Calibration, DecisionPolicy, MatchQuality, ThresholdPolicy, UnknownConfidence};
pub use detector::{DetectionParams, FaceLocator, LocatorFactory, ScrfdLocator};
pub use error::{Error, ErrorKind, Result};
pub use lbph::{LbphRecognizer, TextureClassifier};
pub use recognition::{DetectionRecord, Recognition, RecognitionRecord, Recognizer};
pub use registry::LabelRegistry;
pub use trainer::{TrainReport, TrainingOrchestrator};
pub use types::{BoundingBox, FaceSample, Identity, Label, Prediction, FACE_SIZE, UNKNOWN_IDENTITY};
pub use validator::{SampleValidator, ValidationSummary};
