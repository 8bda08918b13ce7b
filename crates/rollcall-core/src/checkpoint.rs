//! Trained model + label registry, saved and loaded as one unit.
//!
//! Two co-located files: `<name>.lbph.json` (classifier state) and
//! `<name>_labels.toml` (identity → label). Both are staged as temp files
//! in the destination directory and only renamed into place once both are
//! fully written and synced. The label file records the SHA-256 of the model
//! it was written with, so a model published without its labels (a crash
//! between the two renames) is refused at load.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::error::{Error, Result};
use crate::lbph::{LbphRecognizer, TextureClassifier};
use crate::registry::{LabelRegistry, RegistryError};
use crate::types::{FaceSample, Prediction};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPaths {
    pub model: PathBuf,
    pub labels: PathBuf,
}

impl CheckpointPaths {
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            model: dir.join(format!("{name}.lbph.json")),
            labels: dir.join(format!("{name}_labels.toml")),
        }
    }

    pub fn exist(&self) -> bool {
        self.model.is_file() && self.labels.is_file()
    }

    fn dir(&self) -> &Path {
        match self.model.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Checkpoint<C = LbphRecognizer> {
    classifier: C,
    registry: LabelRegistry,
}

impl<C: TextureClassifier> Checkpoint<C> {
    pub fn new(classifier: C, registry: LabelRegistry) -> Self {
        Self { classifier, registry }
    }

    pub fn classifier(&self) -> &C {
        &self.classifier
    }

    pub fn registry(&self) -> &LabelRegistry {
        &self.registry
    }

    pub fn predict(&self, sample: &FaceSample) -> Result<Prediction> {
        Ok(self.classifier.predict(sample)?)
    }

    pub fn save(&self, paths: &CheckpointPaths) -> Result<()> {
        let dir = paths.dir();
        std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;

        let mut model = Vec::new();
        self.classifier.save(&mut model)?;
        let labels = format!(
            "{DIGEST_KEY} = \"{}\"\n\n{}",
            digest(&model),
            self.registry.to_toml()?
        );

        let model_tmp = stage(dir, &model, &paths.model)?;
        let labels_tmp = stage(dir, labels.as_bytes(), &paths.labels)?;
        model_tmp
            .persist(&paths.model)
            .map_err(|e| Error::io(&paths.model, e.error))?;
        labels_tmp
            .persist(&paths.labels)
            .map_err(|e| Error::io(&paths.labels, e.error))?;

        tracing::info!(
            model = %paths.model.display(),
            labels = %paths.labels.display(),
            identities = self.registry.len(),
            "checkpoint saved"
        );
        Ok(())
    }

    /// Both files must exist and the label file must carry the digest of
    /// the model beside it.
    pub fn load(paths: &CheckpointPaths) -> Result<Self> {
        for path in [&paths.model, &paths.labels] {
            if !path.is_file() {
                return Err(Error::CheckpointMissing(path.clone()));
            }
        }

        let model = std::fs::read(&paths.model).map_err(|e| Error::io(&paths.model, e))?;
        let text = std::fs::read_to_string(&paths.labels).map_err(|e| Error::io(&paths.labels, e))?;
        let binding: Binding = toml::from_str(&text).map_err(RegistryError::from)?;
        if binding.model_sha256.as_deref() != Some(digest(&model).as_str()) {
            tracing::error!(
                model = %paths.model.display(),
                labels = %paths.labels.display(),
                "label file does not belong to model"
            );
            return Err(Error::CheckpointUnpaired(paths.labels.clone()));
        }

        let classifier = C::load(&mut model.as_slice())?;
        let registry = LabelRegistry::from_toml(&text)?;

        tracing::info!(
            identities = registry.len(),
            model = %paths.model.display(),
            "checkpoint loaded"
        );
        Ok(Self { classifier, registry })
    }
}

/// Top-level key of the label file naming the model it was written with.
const DIGEST_KEY: &str = "model_sha256";

#[derive(Deserialize)]
struct Binding {
    model_sha256: Option<String>,
}

fn digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes).iter().map(|b| format!("{b:02x}")).collect()
}

/// Write `bytes` to a synced temp file in `dir`, ready to be renamed onto `dest`.
fn stage(dir: &Path, bytes: &[u8], dest: &Path) -> Result<NamedTempFile> {
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| Error::io(dir, e))?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| Error::io(dest, e))?;
    Ok(tmp)
}
