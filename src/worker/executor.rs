use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;

use crate::config::ExecutorConfig;
use crate::error::{ExecutorError, Result};
use crate::ports::PortPool;
use crate::task::{RunningTask, TaskCapabilities, TaskDescriptor, TaskState};

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Terminal outcome of one task, reported to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskUpdate {
    pub task_id: String,
    pub state: TaskState,
    pub exit_code: Option<i32>,
}

/// Runs every task assigned to this node against one shared port pool.
#[derive(Clone)]
pub struct TaskExecutor {
    config: ExecutorConfig,
    ports: Arc<PortPool>,
    capabilities: TaskCapabilities,
    tasks: Arc<RwLock<HashMap<String, Arc<RunningTask>>>>,
    updates: mpsc::Sender<TaskUpdate>,
}

impl TaskExecutor {
    /// Executor with production capabilities derived from `config`.
    pub fn new(config: ExecutorConfig) -> (Self, mpsc::Receiver<TaskUpdate>) {
        let capabilities = TaskCapabilities::local(
            config.pid_resolve_timeout,
            config.kill_grace,
            config.health_check_timeout,
        );
        Self::with_capabilities(config, capabilities)
    }

    pub fn with_capabilities(
        config: ExecutorConfig,
        capabilities: TaskCapabilities,
    ) -> (Self, mpsc::Receiver<TaskUpdate>) {
        let ports =
            Arc::new(PortPool::new(config.port_range.clone()).with_probe(config.probe_ports));
        let (updates, updates_rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);

        let executor = Self {
            config,
            ports,
            capabilities,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            updates,
        };
        (executor, updates_rx)
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn ports(&self) -> &Arc<PortPool> {
        &self.ports
    }

    /// Stage and run a task.
    ///
    /// Staging errors are returned and nothing is registered. Once staged the
    /// task is tracked until terminal; a failed launch still produces a
    /// `Failed` update.
    pub async fn launch(&self, descriptor: TaskDescriptor) -> Result<Arc<RunningTask>> {
        let task_id = descriptor.task_id.clone();
        let task = RunningTask::new(
            descriptor,
            &self.config,
            self.ports.clone(),
            self.capabilities.clone(),
        );

        {
            let mut tasks = self.tasks.write().await;
            if tasks.contains_key(&task_id) {
                return Err(ExecutorError::TaskExists(task_id));
            }
            tasks.insert(task_id.clone(), task.clone());
        }

        if let Err(e) = task.stage().await {
            tracing::warn!(task_id = %task_id, error = %e, "Staging failed");
            self.tasks.write().await.remove(&task_id);
            return Err(e);
        }

        let run_result = task.run().await;
        self.spawn_reaper(task.clone());
        run_result.map(|_| task)
    }

    /// Kill a task. Returns its terminal state.
    pub async fn kill(&self, task_id: &str) -> Result<TaskState> {
        let task = self
            .get(task_id)
            .await
            .ok_or_else(|| ExecutorError::TaskNotFound(task_id.to_string()))?;
        task.terminate(TaskState::Killed).await?;
        Ok(task.state())
    }

    pub async fn get(&self, task_id: &str) -> Option<Arc<RunningTask>> {
        self.tasks.read().await.get(task_id).cloned()
    }

    pub async fn state(&self, task_id: &str) -> Option<TaskState> {
        self.get(task_id).await.map(|task| task.state())
    }

    /// Ids of tasks that have not reached a terminal state yet, sorted.
    pub async fn active_tasks(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .tasks
            .read()
            .await
            .iter()
            .filter(|(_, task)| !task.state().is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Kill every active task and wait until all of them are terminal.
    pub async fn shutdown(&self) {
        let tasks: Vec<Arc<RunningTask>> = self.tasks.read().await.values().cloned().collect();
        tracing::info!(tasks = tasks.len(), "Shutting down executor");

        let mut set = JoinSet::new();
        for task in tasks {
            set.spawn(async move {
                if let Err(e) = task.terminate(TaskState::Killed).await {
                    tracing::warn!(task_id = %task.task_id(), error = %e, "Shutdown kill failed");
                }
                task.wait_for().await
            });
        }
        while set.join_next().await.is_some() {}
    }

    fn spawn_reaper(&self, task: Arc<RunningTask>) {
        let tasks = self.tasks.clone();
        let updates = self.updates.clone();
        tokio::spawn(async move {
            let state = task.wait_for().await;
            tasks.write().await.remove(task.task_id());

            let update = TaskUpdate {
                task_id: task.task_id().to_string(),
                state,
                exit_code: task.exit_code(),
            };
            tracing::debug!(task_id = %update.task_id, state = %state, "Reporting task update");
            if updates.send(update).await.is_err() {
                tracing::debug!(task_id = %task.task_id(), "Update receiver dropped");
            }
        });
    }
}
