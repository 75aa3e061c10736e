//! `manifest.json`: what a run attempted and what it produced.

use crate::collector::{CollectorError, CollectorKind};
use crate::supervisor::command::{SpawnError, Target};
use crate::supervisor::ChildOutcome;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

pub const MANIFEST_NAME: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorEntry {
    pub kind: CollectorKind,
    pub artifact: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Artifact size, when it exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    /// CRC32 of the artifact file, for spotting truncated copies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crc32: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChildEntry {
    Exited { code: i32 },
    Signaled { signal: i32 },
    NotStarted { error: String },
    /// Started, but its termination status could not be read.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    /// RFC 3339 timestamp.
    pub finished_at: String,
    pub program: String,
    pub args: Vec<String>,
    pub child: ChildEntry,
    pub exit_code: i32,
    pub collectors: Vec<CollectorEntry>,
}

impl Manifest {
    pub(crate) fn build(
        dir: &Path,
        target: &Target,
        child: &Result<ChildOutcome, SpawnError>,
        exit_code: i32,
        reports: &[(CollectorKind, Result<(), CollectorError>)],
    ) -> Self {
        let child = match child {
            Ok(ChildOutcome::Exited(code)) => ChildEntry::Exited { code: *code },
            Ok(ChildOutcome::Signaled(signal)) => ChildEntry::Signaled { signal: *signal },
            Ok(ChildOutcome::Unknown) => ChildEntry::Unknown,
            Err(e) => ChildEntry::NotStarted {
                error: e.to_string(),
            },
        };
        let collectors = reports
            .iter()
            .map(|(kind, result)| {
                let artifact = kind.artifact_name();
                let content = fs::read(dir.join(&artifact)).ok();
                CollectorEntry {
                    kind: *kind,
                    bytes: content.as_ref().map(|d| d.len() as u64),
                    crc32: content.as_deref().map(crc32fast::hash),
                    artifact,
                    ok: result.is_ok(),
                    error: result.as_ref().err().map(ToString::to_string),
                }
            })
            .collect();
        Self {
            version: 1,
            finished_at: chrono::Utc::now().to_rfc3339(),
            program: target.program().to_string_lossy().into_owned(),
            args: target
                .args()
                .iter()
                .map(|a| a.to_string_lossy().into_owned())
                .collect(),
            child,
            exit_code,
            collectors,
        }
    }

    /// Writes the manifest into `dir` via a temporary file.
    pub fn write(&self, dir: &Path) -> io::Result<()> {
        let path = dir.join(MANIFEST_NAME);
        let tmp = dir.join(format!("{}.tmp", MANIFEST_NAME));
        let json = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)
    }

    pub fn read(dir: &Path) -> io::Result<Self> {
        let data = fs::read(dir.join(MANIFEST_NAME))?;
        serde_json::from_slice(&data).map_err(io::Error::other)
    }
}
