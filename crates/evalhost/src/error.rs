//! Failure model for worker evaluation and pool operations.

use std::io;

use thiserror::Error;

use crate::worker::WorkerState;

/// Output captured from one evaluation. On failure the same shape carries
/// whatever partial output had been captured before the failure, so callers
/// can render partial results alongside the error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` while the subprocess is still alive.
    pub exit_code: Option<i32>,
}

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("timed out after {timeout_ms}ms waiting for the interpreter ready marker")]
    InitializationTimeout { timeout_ms: u64 },

    #[error("evaluation timed out after {timeout_ms}ms")]
    ExecutionTimeout {
        timeout_ms: u64,
        partial: ExecutionOutput,
    },

    #[error("interpreter exited {}", exit_label(partial))]
    ProcessExit { partial: ExecutionOutput },

    #[error("interpreter exited cleanly without producing any output")]
    CleanExitNoOutput { partial: ExecutionOutput },

    #[error("failed to write evaluation unit to interpreter stdin: {source}")]
    StdinWriteFailure {
        #[source]
        source: io::Error,
        partial: ExecutionOutput,
    },

    #[error("failed to spawn interpreter '{command}': {source}")]
    ProcessSpawnError {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("evaluation interrupted")]
    Interrupted { partial: ExecutionOutput },

    #[error("host is disposed")]
    Disposed,

    #[error("worker is {state} and cannot accept the operation")]
    InvalidState { state: WorkerState },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EvalError {
    /// Partial output captured before the failure, when the evaluation got
    /// far enough to produce any.
    pub fn partial_output(&self) -> Option<&ExecutionOutput> {
        match self {
            Self::ExecutionTimeout { partial, .. }
            | Self::ProcessExit { partial }
            | Self::CleanExitNoOutput { partial }
            | Self::StdinWriteFailure { partial, .. }
            | Self::Interrupted { partial } => Some(partial),
            _ => None,
        }
    }

}

fn exit_label(partial: &ExecutionOutput) -> String {
    match partial.exit_code {
        Some(code) => format!("with code {code}"),
        None => "without an exit code".to_string(),
    }
}
