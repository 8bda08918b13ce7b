//! Identity ↔ label bijection persisted next to the trained model.
//!
//! Only the forward map (identity → label) is written; the reverse map is
//! rebuilt on load.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Identity, Label};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("label {0} not found")]
    LabelNotFound(Label),
    #[error("label {label} assigned to both {first:?} and {second:?}")]
    DuplicateLabel {
        label: Label,
        first: Identity,
        second: Identity,
    },
    #[error("malformed registry: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to encode registry: {0}")]
    Encode(#[from] toml::ser::Error),
}

/// On-disk layout: a single `[labels]` table of `"<identity>" = <label>`.
#[derive(Serialize, Deserialize)]
struct RegistryFile {
    labels: BTreeMap<Identity, Label>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelRegistry {
    forward: BTreeMap<Identity, Label>,
    reverse: BTreeMap<Label, Identity>,
    next_label: Label,
}

impl LabelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing label for `identity`, or the next free one.
    pub fn assign(&mut self, identity: &str) -> Label {
        if let Some(&label) = self.forward.get(identity) {
            return label;
        }
        let label = self.next_label;
        self.next_label += 1;
        self.forward.insert(identity.to_string(), label);
        self.reverse.insert(label, identity.to_string());
        tracing::debug!(identity, label, "assigned label");
        label
    }

    pub fn reverse_lookup(&self, label: Label) -> Result<&str, RegistryError> {
        self.reverse
            .get(&label)
            .map(String::as_str)
            .ok_or(RegistryError::LabelNotFound(label))
    }

    pub fn label_of(&self, identity: &str) -> Option<Label> {
        self.forward.get(identity).copied()
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Identities in label order.
    pub fn identities(&self) -> impl Iterator<Item = (Label, &str)> {
        self.reverse.iter().map(|(&l, id)| (l, id.as_str()))
    }

    pub fn to_toml(&self) -> Result<String, RegistryError> {
        Ok(toml::to_string(&RegistryFile {
            labels: self.forward.clone(),
        })?)
    }

    pub fn from_toml(text: &str) -> Result<Self, RegistryError> {
        let file: RegistryFile = toml::from_str(text)?;
        let mut reverse = BTreeMap::new();
        for (identity, &label) in &file.labels {
            if let Some(first) = reverse.insert(label, identity.clone()) {
                return Err(RegistryError::DuplicateLabel {
                    label,
                    first,
                    second: identity.clone(),
                });
            }
        }
        let next_label = reverse.keys().next_back().map_or(0, |&max| max + 1);
        Ok(Self {
            forward: file.labels,
            reverse,
            next_label,
        })
    }
}
