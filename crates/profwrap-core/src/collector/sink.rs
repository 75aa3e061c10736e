//! Artifact sinks.
//!
//! A collector writes its artifact to `<name>.tmp` and renames it into place
//! on commit. Dropping an uncommitted writer removes the temporary file.

use crate::collector::CollectorError;
use crate::profile::{self, Profile};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Destination of one collector's artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSink {
    path: PathBuf,
}

impl ArtifactSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Final artifact path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Temporary path written before the final rename.
    pub fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Opens the temporary file for writing.
    pub fn open(&self) -> Result<ArtifactWriter, CollectorError> {
        let tmp_path = self.tmp_path();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|source| CollectorError::SinkUnavailable {
                path: tmp_path.clone(),
                source,
            })?;
        Ok(ArtifactWriter {
            path: self.path.clone(),
            tmp_path,
            file: Some(file),
        })
    }
}

/// An open, not yet committed artifact.
#[derive(Debug)]
pub struct ArtifactWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    file: Option<File>,
}

impl ArtifactWriter {
    /// Encodes `profile`, flushes it to disk and renames it into place.
    /// Returns the artifact size in bytes.
    pub fn commit(mut self, profile: &Profile) -> Result<u64, CollectorError> {
        let data = profile::encode(profile)?;
        let Some(mut file) = self.file.take() else {
            return Err(CollectorError::Io(std::io::Error::other(
                "artifact writer already committed",
            )));
        };
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&self.tmp_path, &self.path)?;
        debug!(
            path = %self.path.display(),
            bytes = data.len(),
            samples = profile.samples.len(),
            "artifact committed"
        );
        Ok(data.len() as u64)
    }
}

impl Drop for ArtifactWriter {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}
