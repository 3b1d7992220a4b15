//! Durable checkpoint storage.
//!
//! A checkpoint is a full snapshot of a [`Run`] taken at a transition
//! boundary. Snapshots for one run form an append-only sequence; the one with
//! the highest sequence number is the sole source of truth on resume.

mod file;
#[cfg(test)]
mod memory;

pub use file::FileCheckpointStore;
#[cfg(test)]
pub use memory::MemoryCheckpointStore;

use crate::error::StoreError;
use crate::models::{Run, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One durable snapshot of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    /// Strictly increasing and gapless per run, starting at 1.
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    pub state: Run,
}

/// Registry entry for listing stored runs.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub user_input: String,
    pub sequence_number: u64,
    pub updated_at: DateTime<Utc>,
}

impl From<&Checkpoint> for RunSummary {
    fn from(checkpoint: &Checkpoint) -> Self {
        Self {
            run_id: checkpoint.run_id.clone(),
            status: checkpoint.state.status,
            user_input: checkpoint.state.user_input.clone(),
            sequence_number: checkpoint.sequence_number,
            updated_at: checkpoint.timestamp,
        }
    }
}

/// Append-only keyed snapshot store.
pub trait CheckpointStore: Send + Sync {
    /// Append a snapshot of `state` under `run_id`, assigning the next
    /// sequence number.
    fn put(&self, run_id: &str, state: &Run) -> Result<Checkpoint, StoreError>;

    /// The snapshot with the highest sequence number, if any.
    fn latest(&self, run_id: &str) -> Result<Option<Checkpoint>, StoreError>;

    /// All stored runs, least recently updated first.
    fn list_runs(&self) -> Result<Vec<RunSummary>, StoreError>;

    /// Remove every stored run. Returns the number of runs removed.
    fn clear(&self) -> Result<usize, StoreError>;
}

/// Sort summaries so the most recently updated run comes last.
fn sort_summaries(summaries: &mut [RunSummary]) {
    summaries.sort_by(|a, b| {
        a.updated_at
            .cmp(&b.updated_at)
            .then_with(|| a.run_id.cmp(&b.run_id))
    });
}
