//! Error types for the workflow engine.
//!
//! Per-step failures never show up here: they are recorded as data in
//! [`StepResult::error`](crate::models::StepResult). Everything in
//! [`WorkflowError`] is run-level and ends the current invocation.

use crate::models::RunStatus;
use thiserror::Error;

/// Failures of the durable checkpoint store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint (de)serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("checkpoint {sequence} for run {run_id} already exists")]
    Conflict { run_id: String, sequence: u64 },
}

/// Run-level errors surfaced to the caller of the run controller.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Bad coordinator input. Terminal, never retried.
    #[error("invalid input: {message}")]
    InputValidation { message: String },

    /// The reasoning backend kept producing plans that fail validation.
    #[error("planning failed after {attempts} attempt(s): {message}")]
    Planning { attempts: u32, message: String },

    #[error("failed to write checkpoint for run {run_id}: {source}")]
    CheckpointWrite {
        run_id: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to read checkpoint for run {run_id}: {source}")]
    CheckpointRead {
        run_id: String,
        #[source]
        source: StoreError,
    },

    #[error("no checkpoint found for run {0}")]
    RunNotFound(String),

    #[error("run {run_id} cancelled: {reason}")]
    Cancelled { run_id: String, reason: String },

    #[error("run {run_id} cannot be resumed from status {status}")]
    InvalidResume { run_id: String, status: RunStatus },

    #[error("report generation failed: {0}")]
    Report(String),
}

impl WorkflowError {
    pub fn input(message: impl Into<String>) -> Self {
        WorkflowError::InputValidation {
            message: message.into(),
        }
    }
}
