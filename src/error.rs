use std::path::PathBuf;

use thiserror::Error;

use crate::task::capability::{CopyError, PidError};
use crate::task::TaskState;

/// Failures while materializing a task's sandbox. The task stays `Pending`.
#[derive(Error, Debug)]
pub enum StagingError {
    #[error("Task root already exists: {0}")]
    RootExists(PathBuf),

    #[error("Filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize task descriptor: {0}")]
    Dump(#[from] serde_json::Error),

    #[error("Artifact copy failed: {0}")]
    Copy(#[from] CopyError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortLeaseError {
    #[error("Port lease pool exhausted")]
    Exhausted,
}

/// Failures before the process reached `Running`.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Failed to write launch script {path}: {source}")]
    Script {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to resolve pid: {0}")]
    PidResolution(#[from] PidError),
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Staging failed: {0}")]
    Staging(#[from] StagingError),

    #[error("Command expansion failed: {0}")]
    PortLease(#[from] PortLeaseError),

    #[error("Launch failed: {0}")]
    Launch(#[from] LaunchError),

    #[error("Task {task_id} cannot {action} while {state}")]
    InvalidState {
        task_id: String,
        action: &'static str,
        state: TaskState,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task already exists: {0}")]
    TaskExists(String),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;
