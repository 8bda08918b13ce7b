//! Curated corpus → trained checkpoint.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::augment::Augmenter;
use crate::checkpoint::{Checkpoint, CheckpointPaths};
use crate::config::Config;
use crate::corpus::{file_name, CorpusLayout};
use crate::debug::{self, Annotation};
use crate::detector::{DetectionParams, FaceLocator, LocatorFactory};
use crate::error::{Error, Result};
use crate::lbph::{LbphParams, LbphRecognizer, TextureClassifier};
use crate::preprocess::{load_image, Preprocessor};
use crate::registry::LabelRegistry;
use crate::types::{FaceSample, Identity, Label};
use crate::workers;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrainReport {
    /// Source photos that yielded exactly one face.
    pub face_count: usize,
    pub identity_count: usize,
    pub source_photos: usize,
    pub skipped_photos: usize,
    /// Training samples including augmentation variants.
    pub sample_count: usize,
}

/// Labeled samples ready for the classifier.
#[derive(Debug, Default)]
pub struct TrainingCorpus {
    pub samples: Vec<FaceSample>,
    pub labels: Vec<Label>,
    pub registry: LabelRegistry,
    pub report: TrainReport,
}

pub struct TrainingOrchestrator {
    factory: Arc<LocatorFactory>,
    params: DetectionParams,
    preprocessor: Preprocessor,
    layout: CorpusLayout,
    augmenter: Augmenter,
    lbph: LbphParams,
    workers: usize,
    debug_images: bool,
}

impl TrainingOrchestrator {
    pub fn new(factory: Arc<LocatorFactory>, config: &Config) -> Self {
        Self {
            factory,
            params: config.detection.training,
            preprocessor: Preprocessor::new(config.normalization),
            layout: config.corpus.clone(),
            augmenter: config.augmentation.clone(),
            lbph: config.lbph,
            workers: config.workers,
            debug_images: config.debug_images,
        }
    }

    /// Train an LBPH model on `root` and persist it to `paths`.
    pub fn train(&self, root: &Path, paths: &CheckpointPaths) -> Result<(Checkpoint, TrainReport)> {
        let classifier = LbphRecognizer::new(self.lbph)?;
        self.train_with(classifier, root, paths)
    }

    /// Same as [`train`](Self::train) with a caller-supplied classifier.
    ///
    /// Nothing is written unless at least one sample survives.
    pub fn train_with<C: TextureClassifier>(
        &self,
        mut classifier: C,
        root: &Path,
        paths: &CheckpointPaths,
    ) -> Result<(Checkpoint<C>, TrainReport)> {
        let corpus = self.build_corpus(root)?;
        if corpus.samples.is_empty() {
            tracing::error!(
                root = %root.display(),
                photos = corpus.report.source_photos,
                "no valid face samples"
            );
            return Err(Error::EmptyCorpus);
        }

        classifier.train(&corpus.samples, &corpus.labels)?;
        let checkpoint = Checkpoint::new(classifier, corpus.registry);
        checkpoint.save(paths)?;

        let report = corpus.report;
        tracing::info!(
            faces = report.face_count,
            identities = report.identity_count,
            samples = report.sample_count,
            skipped = report.skipped_photos,
            "training finished"
        );
        Ok((checkpoint, report))
    }

    /// Walk the corpus, re-detect every photo, and assign labels.
    ///
    /// Photos are processed in parallel but merged in identity-then-filename
    /// order, so labels are reproducible.
    pub fn build_corpus(&self, root: &Path) -> Result<TrainingCorpus> {
        let mut jobs = Vec::new();
        for dir in self.layout.identities(root)? {
            for photo in self.layout.photos(&dir.path)? {
                jobs.push((dir.identity.clone(), photo));
            }
        }

        let source_photos = jobs.len();
        let extracted = workers::map_with_locator(
            jobs,
            self.workers,
            &*self.factory,
            |locator, (identity, photo)| {
                let sample = self.extract(locator, &identity, &photo);
                (identity, sample)
            },
        )?;

        let mut corpus = TrainingCorpus::default();
        corpus.report.source_photos = source_photos;
        for (identity, sample) in extracted {
            let Some(sample) = sample else {
                corpus.report.skipped_photos += 1;
                continue;
            };
            let label = corpus.registry.assign(&identity);
            let variants = self.augmenter.expand(&sample);
            corpus.labels.extend(std::iter::repeat(label).take(variants.len()));
            corpus.samples.extend(variants);
            corpus.report.face_count += 1;
        }
        corpus.report.identity_count = corpus.registry.len();
        corpus.report.sample_count = corpus.samples.len();

        for (label, identity) in corpus.registry.identities() {
            let samples = corpus.labels.iter().filter(|&&l| l == label).count();
            tracing::info!(identity, label, samples, "identity enrolled");
        }
        Ok(corpus)
    }

    /// One face sample from one photo, or `None` (logged) when the photo
    /// does not re-detect to exactly one face.
    fn extract(
        &self,
        locator: &mut dyn FaceLocator,
        identity: &Identity,
        photo: &Path,
    ) -> Option<FaceSample> {
        let name = file_name(photo);
        let image = match load_image(photo) {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(
                    identity = %identity,
                    photo = %name,
                    error = %e,
                    "skipping unreadable photo"
                );
                return None;
            }
        };
        let gray = self.preprocessor.prepare(&image);
        let faces = match locator.detect(&gray, &self.params) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(
                    identity = %identity,
                    photo = %name,
                    error = %e,
                    "face locator failed"
                );
                return None;
            }
        };
        let [face] = faces.as_slice() else {
            tracing::warn!(
                identity = %identity,
                photo = %name,
                faces = faces.len(),
                "expected exactly one face, skipping"
            );
            return None;
        };

        let sample = match self.preprocessor.face_sample(&gray, face) {
            Ok(sample) => sample,
            Err(e) => {
                tracing::warn!(
                    identity = %identity,
                    photo = %name,
                    error = %e,
                    "failed to crop face"
                );
                return None;
            }
        };

        if self.debug_images {
            let dest = photo.with_file_name(format!("training_debug_{name}"));
            if let Err(e) = debug::emit(&image, Annotation::TrainingRoi(*face), &dest) {
                tracing::warn!(path = %dest.display(), error = %e, "failed to write debug image");
            }
        }
        tracing::debug!(identity = %identity, photo = %name, ?face, "face extracted");
        Some(sample)
    }
}
