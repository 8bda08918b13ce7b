use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::detector::DetectorError;
use crate::lbph::ClassifierError;
use crate::registry::RegistryError;
use crate::types::Label;

/// Coarse failure classes reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Locator model, corpus directory or checkpoint files absent.
    ResourceMissing,
    /// Zero or several faces where exactly one was required.
    DetectionAmbiguous,
    /// No sample survived curation.
    EmptyCorpus,
    /// A predicted label has no entry in the loaded registry.
    CheckpointMismatch,
    /// Unreadable or corrupt image, failed write.
    IoFailure,
    /// The locator or classifier failed internally.
    Primitive,
    /// Invalid configuration.
    Config,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("corpus directory not found: {}", .0.display())]
    CorpusNotFound(PathBuf),
    #[error("face locator unavailable: {0}")]
    LocatorUnavailable(String),
    #[error("checkpoint incomplete: {} is missing", .0.display())]
    CheckpointMissing(PathBuf),
    #[error("No face detected in image")]
    NoFaceDetected,
    #[error("expected exactly one face, found {found}")]
    DetectionAmbiguous { found: usize },
    #[error("no valid face samples found for training")]
    EmptyCorpus,
    #[error("label {0} not found in the loaded registry (checkpoint/registry mismatch)")]
    CheckpointMismatch(Label),
    #[error("{} was not written with this model", .0.display())]
    CheckpointUnpaired(PathBuf),
    #[error("failed to read image {}: {source}", path.display())]
    ImageRead {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to write image {}: {source}", path.display())]
    ImageWrite {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("face sample must be 100x100, got {width}x{height}")]
    InvalidSample { width: u32, height: u32 },
    #[error("detector: {0}")]
    Detector(DetectorError),
    #[error("classifier: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("registry: {0}")]
    Registry(RegistryError),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CorpusNotFound(_)
            | Error::LocatorUnavailable(_)
            | Error::CheckpointMissing(_) => ErrorKind::ResourceMissing,
            Error::NoFaceDetected | Error::DetectionAmbiguous { .. } => {
                ErrorKind::DetectionAmbiguous
            }
            Error::EmptyCorpus => ErrorKind::EmptyCorpus,
            Error::CheckpointMismatch(_) | Error::CheckpointUnpaired(_) | Error::Registry(_) => {
                ErrorKind::CheckpointMismatch
            }
            Error::ImageRead { .. }
            | Error::ImageWrite { .. }
            | Error::Io { .. }
            | Error::Json { .. } => ErrorKind::IoFailure,
            Error::InvalidSample { .. } | Error::Detector(_) | Error::Classifier(_) => {
                ErrorKind::Primitive
            }
            Error::Config(_) => ErrorKind::Config,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<DetectorError> for Error {
    fn from(err: DetectorError) -> Self {
        match err {
            DetectorError::ModelNotFound(path) => Error::LocatorUnavailable(path),
            other => Error::Detector(other),
        }
    }
}

impl From<RegistryError> for Error {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::LabelNotFound(label) => Error::CheckpointMismatch(label),
            other => Error::Registry(other),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
