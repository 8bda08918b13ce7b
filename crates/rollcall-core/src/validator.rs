//! Enrollment photo curation: keep only photos with exactly one face.
//!
//! Ambiguous photos are never resolved by picking the largest box; they are
//! rejected so the corpus stays one-face-per-sample.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::config::Config;
use crate::corpus::{file_name, CorpusLayout};
use crate::debug::{self, Annotation};
use crate::detector::{DetectionParams, FaceLocator, LocatorFactory};
use crate::error::{Error, Result};
use crate::preprocess::{load_image, Normalization, Preprocessor};
use crate::types::{BoundingBox, Identity};
use crate::workers;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum Disposition {
    Valid { face: BoundingBox },
    NoFace,
    MultiFace { count: usize },
    Unreadable { cause: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhotoReport {
    pub identity: Identity,
    pub path: PathBuf,
    #[serde(flatten)]
    pub disposition: Disposition,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ValidationCounts {
    pub total: usize,
    pub valid: usize,
    pub no_face: usize,
    pub multi_face: usize,
    pub unreadable: usize,
}

impl ValidationCounts {
    fn record(&mut self, disposition: &Disposition) {
        self.total += 1;
        match disposition {
            Disposition::Valid { .. } => self.valid += 1,
            Disposition::NoFace => self.no_face += 1,
            Disposition::MultiFace { .. } => self.multi_face += 1,
            Disposition::Unreadable { .. } => self.unreadable += 1,
        }
    }

    pub fn invalid(&self) -> usize {
        self.total - self.valid
    }

    /// Percentage of valid photos; 0 when nothing was processed.
    pub fn validation_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.valid as f64 * 100.0 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationSummary {
    pub overall: ValidationCounts,
    pub per_identity: BTreeMap<Identity, ValidationCounts>,
    pub photos: Vec<PhotoReport>,
}

pub struct SampleValidator {
    factory: Arc<LocatorFactory>,
    params: DetectionParams,
    preprocessor: Preprocessor,
    layout: CorpusLayout,
    workers: usize,
    debug_images: bool,
}

impl SampleValidator {
    pub fn new(factory: Arc<LocatorFactory>, config: &Config) -> Self {
        Self {
            factory,
            params: config.detection.enrollment,
            preprocessor: Preprocessor::new(Normalization::Equalize),
            layout: config.corpus.clone(),
            workers: config.workers,
            debug_images: config.debug_images,
        }
    }

    /// Classify one photo. Never fails: decode and locator errors become
    /// [`Disposition::Unreadable`].
    pub fn classify(&self, locator: &mut dyn FaceLocator, photo: &Path) -> Disposition {
        self.inspect(locator, photo).0
    }

    fn inspect(
        &self,
        locator: &mut dyn FaceLocator,
        photo: &Path,
    ) -> (Disposition, Vec<BoundingBox>) {
        let image = match load_image(photo) {
            Ok(image) => image,
            Err(e) => return (Disposition::Unreadable { cause: e.to_string() }, Vec::new()),
        };
        let gray = self.preprocessor.prepare(&image);
        let faces = match locator.detect(&gray, &self.params) {
            Ok(faces) => faces,
            Err(e) => return (Disposition::Unreadable { cause: e.to_string() }, Vec::new()),
        };
        let disposition = match faces.as_slice() {
            [] => Disposition::NoFace,
            [face] => Disposition::Valid { face: *face },
            many => Disposition::MultiFace { count: many.len() },
        };
        (disposition, faces)
    }

    /// Validate every identity directory under `source` into `dest`.
    ///
    /// Valid photos are copied byte-for-byte to `dest/<identity dir>/`.
    /// Per-photo problems are logged and counted; only filesystem failures
    /// on the destination abort the run.
    pub fn run(&self, source: &Path, dest: &Path) -> Result<ValidationSummary> {
        let identities = self.layout.identities(source)?;
        let mut jobs = Vec::new();
        for dir in &identities {
            let target = dest.join(&dir.dir_name);
            std::fs::create_dir_all(&target).map_err(|e| Error::io(&target, e))?;
            for photo in self.layout.photos(&dir.path)? {
                jobs.push((dir.identity.clone(), photo, target.clone()));
            }
        }
        tracing::info!(
            identities = identities.len(),
            photos = jobs.len(),
            "validating enrollment photos"
        );

        let results = workers::map_with_locator(
            jobs,
            self.workers,
            &*self.factory,
            |locator, (identity, photo, target)| self.process(locator, identity, photo, &target),
        )?;

        let mut summary = ValidationSummary::default();
        for dir in &identities {
            summary.per_identity.entry(dir.identity.clone()).or_default();
        }
        for report in results {
            let report = report?;
            summary.overall.record(&report.disposition);
            summary
                .per_identity
                .entry(report.identity.clone())
                .or_default()
                .record(&report.disposition);
            summary.photos.push(report);
        }

        for (identity, counts) in &summary.per_identity {
            tracing::info!(
                identity = %identity,
                total = counts.total,
                valid = counts.valid,
                "identity validated"
            );
        }
        tracing::info!(
            total = summary.overall.total,
            valid = summary.overall.valid,
            no_face = summary.overall.no_face,
            multi_face = summary.overall.multi_face,
            unreadable = summary.overall.unreadable,
            "validation finished"
        );
        Ok(summary)
    }

    fn process(
        &self,
        locator: &mut dyn FaceLocator,
        identity: Identity,
        photo: PathBuf,
        target: &Path,
    ) -> Result<PhotoReport> {
        let (disposition, faces) = self.inspect(locator, &photo);
        let name = file_name(&photo);

        match &disposition {
            Disposition::Valid { .. } => {
                let copy = target.join(&name);
                std::fs::copy(&photo, &copy).map_err(|e| Error::io(&copy, e))?;
                tracing::info!(identity = %identity, photo = %name, "valid face");
            }
            Disposition::NoFace => {
                tracing::warn!(identity = %identity, photo = %name, "no face detected")
            }
            Disposition::MultiFace { count } => tracing::warn!(
                identity = %identity,
                photo = %name,
                faces = count,
                "multiple faces detected"
            ),
            Disposition::Unreadable { cause } => tracing::warn!(
                identity = %identity,
                photo = %name,
                cause = %cause,
                "unreadable photo"
            ),
        }

        if self.debug_images && !matches!(disposition, Disposition::Unreadable { .. }) {
            self.write_debug(&photo, &disposition, &faces, &target.join(format!("debug_{name}")));
        }

        Ok(PhotoReport {
            identity,
            path: photo,
            disposition,
        })
    }

    fn write_debug(
        &self,
        photo: &Path,
        disposition: &Disposition,
        faces: &[BoundingBox],
        dest: &Path,
    ) {
        let annotation = match disposition {
            Disposition::Valid { face } => Annotation::Valid(*face),
            Disposition::NoFace => Annotation::NoFace,
            Disposition::MultiFace { .. } => Annotation::MultiFace(faces),
            Disposition::Unreadable { .. } => return,
        };
        let result = load_image(photo).and_then(|image| debug::emit(&image, annotation, dest));
        if let Err(e) = result {
            tracing::warn!(path = %dest.display(), error = %e, "failed to write debug image");
        }
    }
}
