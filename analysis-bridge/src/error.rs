use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Processing(#[from] ProcessingError),
}

/// Failures while locating or validating the external runtime.
///
/// `Clone` so a single provisioning failure can be handed to every caller
/// that was waiting on the same attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentError {
    #[error("Python runtime not found. Please install Python 3.8+ or set PYTHON_PATH")]
    RuntimeNotFound,

    /// `PYTHON_PATH` points at a file that does not answer the version probe.
    #[error("Python not accessible at `{executable}`: {reason}")]
    RuntimeInaccessible { executable: String, reason: String },

    #[error("Analysis script not found: {}", .0.display())]
    ScriptMissing(PathBuf),
}

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Failed to start worker process `{program}`: {source}")]
    Start {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker process I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker process timed out after {0:?}")]
    Timeout(Duration),

    #[error("Worker process was cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("Document not found: {}", .0.display())]
    NotFound(PathBuf),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
