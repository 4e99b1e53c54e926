use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::StagingError;
use crate::task::capability::{CopyRequest, FileCopier};
use crate::task::descriptor::{TaskDescriptor, TaskDump};

pub const SANDBOX_DIR: &str = "sandbox";
pub const TASK_DUMP_FILE: &str = "task.dump";
pub const TASK_STATUS_FILE: &str = "task.status";
pub const PID_FILE: &str = "pidfile";
pub const RUN_SCRIPT: &str = "run.sh";
pub const STDOUT_FILE: &str = "stdout";
pub const STDERR_FILE: &str = "stderr";

/// Fixed layout of one execution attempt on disk.
///
/// ```text
/// <execution_root>/<task_id>/
///     task.dump      descriptor snapshot
///     pidfile        written by run.sh
///     task.status    written once, at termination
///     sandbox/       process working directory
///         run.sh  stdout  stderr
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn work_dir(&self) -> PathBuf {
        self.root.join(SANDBOX_DIR)
    }

    pub fn dump_file(&self) -> PathBuf {
        self.root.join(TASK_DUMP_FILE)
    }

    pub fn status_file(&self) -> PathBuf {
        self.root.join(TASK_STATUS_FILE)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join(PID_FILE)
    }

    pub fn run_script(&self) -> PathBuf {
        self.work_dir().join(RUN_SCRIPT)
    }

    pub fn stdout_file(&self) -> PathBuf {
        self.work_dir().join(STDOUT_FILE)
    }

    pub fn stderr_file(&self) -> PathBuf {
        self.work_dir().join(STDERR_FILE)
    }

    /// Create the directory tree, write `task.dump` and copy artifacts in.
    ///
    /// Refuses to reuse an existing root so a previous attempt's files are
    /// never clobbered.
    pub async fn stage(
        &self,
        descriptor: &TaskDescriptor,
        copier: &dyn FileCopier,
    ) -> Result<(), StagingError> {
        if let Some(parent) = self.root.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StagingError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        match tokio::fs::create_dir(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StagingError::RootExists(self.root.clone()));
            }
            Err(source) => {
                return Err(StagingError::Io {
                    path: self.root.clone(),
                    source,
                });
            }
        }

        let work_dir = self.work_dir();
        tokio::fs::create_dir(&work_dir)
            .await
            .map_err(|source| StagingError::Io {
                path: work_dir.clone(),
                source,
            })?;

        let dump = TaskDump {
            descriptor: descriptor.clone(),
            staged_at: Utc::now(),
        };
        let body = serde_json::to_vec_pretty(&dump)?;
        let dump_file = self.dump_file();
        tokio::fs::write(&dump_file, body)
            .await
            .map_err(|source| StagingError::Io {
                path: dump_file,
                source,
            })?;

        for source in &descriptor.artifacts {
            let request = CopyRequest {
                source: source.clone(),
                dest: work_dir.join(artifact_file_name(source)),
            };
            let local = copier.copy(&request).await?;
            tracing::debug!(
                task_id = %descriptor.task_id,
                source = %source,
                local = %local.display(),
                "Artifact staged"
            );
        }

        tracing::info!(
            task_id = %descriptor.task_id,
            root = %self.root.display(),
            artifacts = descriptor.artifacts.len(),
            "Sandbox staged"
        );
        Ok(())
    }
}

/// Last path segment of an artifact reference, e.g. `hdfs://nn/pkg/app.zip` -> `app.zip`.
fn artifact_file_name(source: &str) -> &str {
    source
        .trim_end_matches('/')
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("artifact")
}
