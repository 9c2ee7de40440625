//! Executor error types.

use thiserror::Error;

/// Errors that can occur while running a formula's steps.
#[derive(Error, Debug)]
pub enum ExecuteError {
    #[error(
        "step failed: {command} (exit code: {code:?})\n--- stdout ---\n{stdout}\n--- stderr ---\n{stderr}"
    )]
    StepFailed {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("cannot spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("working directory does not exist: {0}")]
    WorkdirMissing(String),

    #[error("cancelled while running: {command}")]
    Cancelled { command: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
