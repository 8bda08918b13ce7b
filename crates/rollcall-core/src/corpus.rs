//! On-disk corpus layout: `<root>/<identity>/face_*.{jpg,jpeg,png}`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::Identity;

const PHOTO_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// File name prefixes of images this crate writes itself.
const ARTIFACT_PREFIXES: [&str; 3] = ["debug_", "prep_", "training_debug_"];

/// Naming convention for identity directories and photos.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorpusLayout {
    /// Directory names that never hold an identity (negatives, scratch).
    pub reserved: Vec<String>,
    /// When set, only directories starting with this prefix are identities
    /// and the prefix is stripped from the name.
    pub identity_prefix: Option<String>,
    pub photo_prefix: String,
}

impl Default for CorpusLayout {
    fn default() -> Self {
        Self {
            reserved: vec!["random".into(), "unlabeled".into(), "negative".into()],
            identity_prefix: None,
            photo_prefix: "face_".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityDir {
    pub identity: Identity,
    /// Directory name as found on disk (before prefix stripping).
    pub dir_name: String,
    pub path: PathBuf,
}

impl CorpusLayout {
    /// Identity for a directory name, or `None` if it is not an identity directory.
    pub fn identity_for(&self, dir_name: &str) -> Option<Identity> {
        if dir_name.starts_with('.') || self.reserved.iter().any(|r| r == dir_name) {
            return None;
        }
        let identity = match &self.identity_prefix {
            Some(prefix) => dir_name.strip_prefix(prefix.as_str())?,
            None => dir_name,
        };
        (!identity.is_empty()).then(|| identity.to_string())
    }

    pub fn is_photo(&self, file_name: &str) -> bool {
        if ARTIFACT_PREFIXES.iter().any(|p| file_name.starts_with(p)) {
            return false;
        }
        if !file_name.starts_with(&self.photo_prefix) {
            return false;
        }
        Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| PHOTO_EXTENSIONS.iter().any(|p| ext.eq_ignore_ascii_case(p)))
    }

    /// Identity directories under `root`, in directory-name order.
    pub fn identities(&self, root: &Path) -> Result<Vec<IdentityDir>> {
        if !root.is_dir() {
            return Err(Error::CorpusNotFound(root.to_path_buf()));
        }
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(root).map_err(|e| Error::io(root, e))? {
            let entry = entry.map_err(|e| Error::io(root, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(dir_name) = entry.file_name().to_str().map(str::to_string) else {
                tracing::warn!(path = %entry.path().display(), "skipping non-UTF-8 directory");
                continue;
            };
            match self.identity_for(&dir_name) {
                Some(identity) => dirs.push(IdentityDir {
                    identity,
                    dir_name,
                    path: entry.path(),
                }),
                None => tracing::debug!(dir = %dir_name, "not an identity directory"),
            }
        }
        dirs.sort_by(|a, b| a.dir_name.cmp(&b.dir_name));
        Ok(dirs)
    }

    /// Candidate photos in `dir`, in file-name order.
    pub fn photos(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut photos = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
            let entry = entry.map_err(|e| Error::io(dir, e))?;
            let path = entry.path();
            if path.is_file() && entry.file_name().to_str().is_some_and(|n| self.is_photo(n)) {
                photos.push(path);
            }
        }
        photos.sort();
        Ok(photos)
    }
}

/// File name of `path` as a string, for logs and artifact names.
pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
