//! File-backed checkpoint store.
//!
//! Layout: `<root>/runs/<run_id>/<sequence>.json`, one file per snapshot.
//! Files are written to a temporary file in the same directory and then
//! persisted without clobbering, so a sequence number is never overwritten
//! and a crash never leaves a half-written snapshot behind.

use super::{sort_summaries, Checkpoint, CheckpointStore, RunSummary};
use crate::error::StoreError;
use crate::models::Run;
use chrono::Utc;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

pub struct FileCheckpointStore {
    runs_dir: PathBuf,
}

impl FileCheckpointStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let runs_dir = root.into().join("runs");
        fs::create_dir_all(&runs_dir)?;
        Ok(Self { runs_dir })
    }

    fn run_dir(&self, run_id: &str) -> Result<PathBuf, StoreError> {
        let valid = !run_id.is_empty()
            && run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid run id: {:?}", run_id),
            )));
        }
        Ok(self.runs_dir.join(run_id))
    }

    fn snapshot_path(dir: &Path, sequence: u64) -> PathBuf {
        dir.join(format!("{:010}.json", sequence))
    }

    /// Highest sequence number stored in `dir`, or 0 when there is none.
    fn highest_sequence(dir: &Path) -> Result<u64, StoreError> {
        if !dir.exists() {
            return Ok(0);
        }

        let mut highest = 0;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let sequence = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok());
            if let Some(sequence) = sequence {
                highest = highest.max(sequence);
            }
        }
        Ok(highest)
    }

    fn read_checkpoint(path: &Path) -> Result<Checkpoint, StoreError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn put(&self, run_id: &str, state: &Run) -> Result<Checkpoint, StoreError> {
        let dir = self.run_dir(run_id)?;
        fs::create_dir_all(&dir)?;

        let sequence = Self::highest_sequence(&dir)? + 1;
        let checkpoint = Checkpoint {
            run_id: run_id.to_string(),
            sequence_number: sequence,
            timestamp: Utc::now(),
            state: state.clone(),
        };

        let mut tmp = NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, &checkpoint)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;

        let path = Self::snapshot_path(&dir, sequence);
        tmp.persist_noclobber(&path).map_err(|e| {
            if e.error.kind() == io::ErrorKind::AlreadyExists {
                StoreError::Conflict {
                    run_id: run_id.to_string(),
                    sequence,
                }
            } else {
                StoreError::Io(e.error)
            }
        })?;

        debug!(run_id, sequence, path = %path.display(), "Checkpoint written");
        Ok(checkpoint)
    }

    fn latest(&self, run_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let dir = self.run_dir(run_id)?;
        let sequence = Self::highest_sequence(&dir)?;
        if sequence == 0 {
            return Ok(None);
        }
        Self::read_checkpoint(&Self::snapshot_path(&dir, sequence)).map(Some)
    }

    fn list_runs(&self) -> Result<Vec<RunSummary>, StoreError> {
        let mut summaries = Vec::new();

        for entry in fs::read_dir(&self.runs_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(run_id) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            if let Some(checkpoint) = self.latest(&run_id)? {
                summaries.push(RunSummary::from(&checkpoint));
            }
        }

        sort_summaries(&mut summaries);
        Ok(summaries)
    }

    fn clear(&self) -> Result<usize, StoreError> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.runs_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
