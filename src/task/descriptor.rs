use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Staged,
    Running,
    Finished,
    Failed,
    Killed,
    Lost,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Failed | TaskState::Killed | TaskState::Lost
        )
    }

    /// Non-terminal transitions only. Terminal states are entered through
    /// the termination controller, which may interrupt any live state.
    pub fn can_advance_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Pending, TaskState::Staged) | (TaskState::Staged, TaskState::Running)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "PENDING"),
            TaskState::Staged => write!(f, "STAGED"),
            TaskState::Running => write!(f, "RUNNING"),
            TaskState::Finished => write!(f, "FINISHED"),
            TaskState::Failed => write!(f, "FAILED"),
            TaskState::Killed => write!(f, "KILLED"),
            TaskState::Lost => write!(f, "LOST"),
        }
    }
}

/// One task assignment, as handed over by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Unique per execution attempt; names the task's root directory
    pub task_id: String,
    /// Position of this task within its job's replica set
    pub shard_id: u32,
    pub owner: String,
    pub job_name: String,
    /// Command template, may contain `%shard_id%` and `%port:<name>%`
    pub start_command: String,
    /// Absent disables health checking
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_interval_ms: Option<u64>,
    /// Sources copied into the sandbox before launch
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl TaskDescriptor {
    pub fn new(
        task_id: impl Into<String>,
        shard_id: u32,
        owner: impl Into<String>,
        job_name: impl Into<String>,
        start_command: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            shard_id,
            owner: owner.into(),
            job_name: job_name.into(),
            start_command: start_command.into(),
            health_check_interval_ms: None,
            artifacts: Vec::new(),
        }
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn with_artifact(mut self, source: impl Into<String>) -> Self {
        self.artifacts.push(source.into());
        self
    }

    /// Zero is treated the same as absent.
    pub fn health_check_interval(&self) -> Option<Duration> {
        self.health_check_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

/// Audit copy of the descriptor written to `task.dump`.
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskDump {
    #[serde(flatten)]
    pub descriptor: TaskDescriptor,
    pub staged_at: DateTime<Utc>,
}

/// Terminal record written once to `task.status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusRecord {
    pub task_id: String,
    pub state: TaskState,
    pub exit_code: Option<i32>,
    pub cause: Option<String>,
    pub finished_at: DateTime<Utc>,
}
