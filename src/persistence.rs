//! # Runner Snapshots
//!
//! The snapshot is the authoritative copy of the runner state, not a log:
//! restoring one loads the aggregate directly and never replays pings through
//! the passage detector.
//!
//! Documents are versioned and carry the course fingerprint. They are written
//! to a temporary file in the target directory and renamed over the previous
//! snapshot, so a reader never sees a partial document.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::config::SnapshotFormat;
use crate::course::Course;
use crate::error::{Result, TrackerError};
use crate::state::RunnerState;

/// Current snapshot document version.
pub const SNAPSHOT_VERSION: u32 = 1;

// ============================================================================
// Document
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub fingerprint: String,
    pub race_name: String,
    pub saved_at: DateTime<Utc>,
    pub state: RunnerState,
}

impl Snapshot {
    pub fn capture(course: &Course, state: &RunnerState) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            fingerprint: course.fingerprint().to_string(),
            race_name: course.race_name().to_string(),
            saved_at: Utc::now(),
            state: state.clone(),
        }
    }

    /// Check that the snapshot belongs to `course` and hand back its state.
    pub fn into_state(self, course: &Course) -> Result<RunnerState> {
        if self.fingerprint != course.fingerprint() {
            return Err(TrackerError::FingerprintMismatch {
                expected: course.fingerprint().to_string(),
                found: self.fingerprint,
            });
        }
        if !self.state.matches_station_count(course.stations().len()) {
            return Err(TrackerError::Persistence {
                message: format!(
                    "snapshot tracks {} stations, course has {}",
                    self.state.passages().len(),
                    course.stations().len()
                ),
            });
        }
        Ok(self.state)
    }
}

/// Just enough of a document to check its version before decoding the rest.
#[derive(Deserialize)]
struct SnapshotHeader {
    version: u32,
}

fn encode(snapshot: &Snapshot, format: SnapshotFormat) -> Result<Vec<u8>> {
    match format {
        SnapshotFormat::Json => serde_json::to_vec_pretty(snapshot).map_err(TrackerError::persistence),
        SnapshotFormat::MessagePack => rmp_serde::to_vec_named(snapshot).map_err(TrackerError::persistence),
    }
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8], format: SnapshotFormat) -> Result<T> {
    match format {
        SnapshotFormat::Json => serde_json::from_slice(bytes).map_err(TrackerError::persistence),
        SnapshotFormat::MessagePack => rmp_serde::from_slice(bytes).map_err(TrackerError::persistence),
    }
}

// ============================================================================
// Store
// ============================================================================

/// A snapshot file on disk.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
    format: SnapshotFormat,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>, format: SnapshotFormat) -> Self {
        Self {
            path: path.into(),
            format,
        }
    }

    /// Store named after the race inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>, race_name: &str, format: SnapshotFormat) -> Self {
        let slug: String = race_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect();
        let extension = match format {
            SnapshotFormat::Json => "json",
            SnapshotFormat::MessagePack => "msgpack",
        };
        Self::new(dir.as_ref().join(format!("{}.snapshot.{}", slug, extension)), format)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> SnapshotFormat {
        self.format
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Replace the stored snapshot atomically.
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let bytes = encode(snapshot, self.format)?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut file = NamedTempFile::new_in(dir).map_err(TrackerError::persistence)?;
        file.write_all(&bytes).map_err(TrackerError::persistence)?;
        file.as_file().sync_all().map_err(TrackerError::persistence)?;
        file.persist(&self.path).map_err(TrackerError::persistence)?;

        log::debug!(
            "[Snapshot] wrote {} bytes to {} ({} pings)",
            bytes.len(),
            self.path.display(),
            snapshot.state.ping_count()
        );
        Ok(())
    }

    /// Read the stored snapshot, if any.
    pub fn load(&self) -> Result<Option<Snapshot>> {
        if !self.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path).map_err(TrackerError::persistence)?;
        let header: SnapshotHeader = decode(&bytes, self.format)?;
        if header.version != SNAPSHOT_VERSION {
            return Err(TrackerError::UnsupportedSnapshotVersion {
                found: header.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        decode(&bytes, self.format).map(Some)
    }

    /// Load the stored state for `course`.
    ///
    /// Fails with [`TrackerError::FingerprintMismatch`] when the snapshot was
    /// written for a different station configuration.
    pub fn restore(&self, course: &Course) -> Result<Option<RunnerState>> {
        let snapshot = match self.load()? {
            Some(s) => s,
            None => return Ok(None),
        };
        let saved_at = snapshot.saved_at;
        let state = snapshot.into_state(course)?;
        log::info!(
            "[Snapshot] restored {} pings for '{}' saved at {}",
            state.ping_count(),
            course.race_name(),
            saved_at
        );
        Ok(Some(state))
    }
}
