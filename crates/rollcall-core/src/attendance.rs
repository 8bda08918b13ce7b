//! Per-session attendance records.
//!
//! Present is sticky: once an identity is marked present nothing in the
//! session moves it back to absent.

use std::collections::BTreeMap;
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Present,
    Absent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub status: AttendanceStatus,
    /// When the identity was first marked (present or absent).
    pub marked_at: DateTime<Utc>,
    /// Best recognition confidence seen this session; 0 for absentees.
    pub best_confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceLedger {
    pub session: String,
    pub started_at: DateTime<Utc>,
    records: BTreeMap<Identity, AttendanceRecord>,
}

impl AttendanceLedger {
    pub fn new(session: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            session: session.into(),
            started_at,
            records: BTreeMap::new(),
        }
    }

    /// Returns `true` when this call changed the identity's status to present.
    pub fn mark_present(&mut self, identity: &str, confidence: f64, at: DateTime<Utc>) -> bool {
        match self.records.get_mut(identity) {
            Some(record) if record.status == AttendanceStatus::Present => {
                record.best_confidence = record.best_confidence.max(confidence);
                false
            }
            Some(record) => {
                record.status = AttendanceStatus::Present;
                record.marked_at = at;
                record.best_confidence = confidence;
                tracing::info!(identity, confidence, "absent record upgraded to present");
                true
            }
            None => {
                self.records.insert(
                    identity.to_string(),
                    AttendanceRecord {
                        status: AttendanceStatus::Present,
                        marked_at: at,
                        best_confidence: confidence,
                    },
                );
                tracing::info!(identity, confidence, "marked present");
                true
            }
        }
    }

    /// Insert an absent record; an existing record is left untouched.
    pub fn mark_absent(&mut self, identity: &str, at: DateTime<Utc>) {
        self.records.entry(identity.to_string()).or_insert(AttendanceRecord {
            status: AttendanceStatus::Absent,
            marked_at: at,
            best_confidence: 0.0,
        });
    }

    pub fn status(&self, identity: &str) -> Option<AttendanceStatus> {
        self.records.get(identity).map(|r| r.status)
    }

    pub fn record(&self, identity: &str) -> Option<&AttendanceRecord> {
        self.records.get(identity)
    }

    pub fn present(&self) -> impl Iterator<Item = &str> {
        self.records
            .iter()
            .filter(|(_, r)| r.status == AttendanceStatus::Present)
            .map(|(id, _)| id.as_str())
    }

    /// Roster members not marked present, in roster order.
    pub fn absent_from<'a>(&self, roster: impl IntoIterator<Item = &'a str>) -> Vec<Identity> {
        roster
            .into_iter()
            .filter(|id| self.status(id) != Some(AttendanceStatus::Present))
            .map(str::to_string)
            .collect()
    }

    /// Mark every roster member not seen as absent.
    pub fn close<'a>(
        &mut self,
        roster: impl IntoIterator<Item = &'a str>,
        at: DateTime<Utc>,
    ) -> Vec<Identity> {
        let absent = self.absent_from(roster);
        for identity in &absent {
            self.mark_absent(identity, at);
        }
        absent
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path).map_err(|e| Error::io(path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self).map_err(|source| Error::Json {
            path: path.to_path_buf(),
            source,
        })?;
        writer.flush().map_err(|e| Error::io(path, e))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        serde_json::from_str(&text).map_err(|source| Error::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}
