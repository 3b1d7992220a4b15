//! In-memory checkpoint store used by the workflow tests.

use super::{sort_summaries, Checkpoint, CheckpointStore, RunSummary};
use crate::error::StoreError;
use crate::models::Run;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct MemoryCheckpointStore {
    runs: Mutex<HashMap<String, Vec<Checkpoint>>>,
    /// Writes fail once a run holds this many snapshots.
    write_limit: AtomicUsize,
}

impl Default for MemoryCheckpointStore {
    fn default() -> Self {
        Self {
            runs: Mutex::default(),
            write_limit: AtomicUsize::new(usize::MAX),
        }
    }
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail with an I/O error.
    pub fn fail_writes(&self, fail: bool) {
        let limit = if fail { 0 } else { usize::MAX };
        self.write_limit.store(limit, Ordering::SeqCst);
    }

    /// Accept writes until a run holds `count` snapshots, then fail.
    pub fn fail_writes_after(&self, count: usize) {
        self.write_limit.store(count, Ordering::SeqCst);
    }

    /// Every snapshot stored for `run_id`, oldest first.
    pub fn history(&self, run_id: &str) -> Vec<Checkpoint> {
        self.runs.lock().get(run_id).cloned().unwrap_or_default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn put(&self, run_id: &str, state: &Run) -> Result<Checkpoint, StoreError> {
        let mut runs = self.runs.lock();
        let stored = runs.get(run_id).map_or(0, Vec::len);
        if stored >= self.write_limit.load(Ordering::SeqCst) {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::Other,
                "disk full",
            )));
        }

        let history = runs.entry(run_id.to_string()).or_default();
        let checkpoint = Checkpoint {
            run_id: run_id.to_string(),
            sequence_number: history.len() as u64 + 1,
            timestamp: Utc::now(),
            state: state.clone(),
        };
        history.push(checkpoint.clone());
        Ok(checkpoint)
    }

    fn latest(&self, run_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self
            .runs
            .lock()
            .get(run_id)
            .and_then(|h| h.last().cloned()))
    }

    fn list_runs(&self) -> Result<Vec<RunSummary>, StoreError> {
        let mut summaries: Vec<RunSummary> = self
            .runs
            .lock()
            .values()
            .filter_map(|h| h.last())
            .map(RunSummary::from)
            .collect();
        sort_summaries(&mut summaries);
        Ok(summaries)
    }

    fn clear(&self) -> Result<usize, StoreError> {
        let mut runs = self.runs.lock();
        let removed = runs.len();
        runs.clear();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_sequences() {
        let store = MemoryCheckpointStore::new();
        let run = Run::new("r", "x");
        assert_eq!(store.put("r", &run).unwrap().sequence_number, 1);
        assert_eq!(store.put("r", &run).unwrap().sequence_number, 2);
        assert_eq!(store.latest("r").unwrap().unwrap().sequence_number, 2);
        assert_eq!(store.history("r").len(), 2);
    }

    #[test]
    fn test_memory_store_failure_injection() {
        let store = MemoryCheckpointStore::new();
        store.fail_writes(true);
        assert!(store.put("r", &Run::new("r", "x")).is_err());
        assert!(store.latest("r").unwrap().is_none());

        store.fail_writes_after(1);
        assert!(store.put("r", &Run::new("r", "x")).is_ok());
        assert!(store.put("r", &Run::new("r", "x")).is_err());
        assert_eq!(store.history("r").len(), 1);
    }
}
