use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::config::ExecutorConfig;
use crate::error::{ExecutorError, Result};
use crate::ports::PortLeaser;
use crate::task::capability::{HealthTarget, TaskCapabilities};
use crate::task::descriptor::{TaskDescriptor, TaskState};
use crate::task::health::HealthSupervisor;
use crate::task::launcher;
use crate::task::sandbox::Sandbox;
use crate::task::template::{self, ExpandedCommand};
use crate::task::termination::{Termination, TerminationController};

/// Port name that, when present in the command, becomes the health check target.
pub const HEALTH_PORT_NAME: &str = "health";

/// One execution attempt of one task.
///
/// Lifecycle: [`stage`](Self::stage), [`run`](Self::run), then
/// [`wait_for`](Self::wait_for) the terminal state. [`terminate`](Self::terminate)
/// may be called from anywhere at any time.
pub struct RunningTask {
    descriptor: TaskDescriptor,
    sandbox: Sandbox,
    config: ExecutorConfig,
    capabilities: TaskCapabilities,
    ports: Arc<dyn PortLeaser>,
    controller: Arc<TerminationController>,
    expansion: Mutex<Option<ExpandedCommand>>,
}

impl RunningTask {
    pub fn new(
        descriptor: TaskDescriptor,
        config: &ExecutorConfig,
        ports: Arc<dyn PortLeaser>,
        capabilities: TaskCapabilities,
    ) -> Arc<Self> {
        let sandbox = Sandbox::new(config.task_root(&descriptor.task_id));
        let controller = Arc::new(TerminationController::new(
            descriptor.task_id.clone(),
            &sandbox,
            capabilities.killer.clone(),
            ports.clone(),
        ));

        Arc::new(Self {
            descriptor,
            sandbox,
            config: config.clone(),
            capabilities,
            ports,
            controller,
            expansion: Mutex::new(None),
        })
    }

    pub fn task_id(&self) -> &str {
        &self.descriptor.task_id
    }

    pub fn descriptor(&self) -> &TaskDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> TaskState {
        self.controller.state()
    }

    /// Observe every state transition.
    pub fn subscribe(&self) -> watch::Receiver<TaskState> {
        self.controller.subscribe()
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn root_dir(&self) -> &Path {
        self.sandbox.root()
    }

    /// The process's working directory.
    pub fn sandbox_dir(&self) -> PathBuf {
        self.sandbox.work_dir()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.controller.exit_code()
    }

    pub fn pid(&self) -> Option<u32> {
        self.controller.pid()
    }

    /// Ports currently held by this task (empty once terminal).
    pub fn leased_ports(&self) -> HashMap<String, u16> {
        self.controller.leased_ports()
    }

    /// Materialize the sandbox. `Pending -> Staged`.
    pub async fn stage(&self) -> Result<()> {
        self.require(TaskState::Pending, "stage")?;
        self.sandbox
            .stage(&self.descriptor, self.capabilities.copier.as_ref())
            .await?;

        if !self.controller.advance(TaskState::Staged) {
            return Err(self.invalid("finish staging"));
        }
        Ok(())
    }

    /// Expand the start command, leasing its ports.
    ///
    /// The expansion happens once per task; later calls return the same
    /// command and ports. Leases are released when the task terminates.
    pub fn expand_command_line(&self) -> Result<ExpandedCommand> {
        let mut expansion = self.expansion.lock();
        if let Some(expanded) = expansion.as_ref() {
            return Ok(expanded.clone());
        }
        if self.state().is_terminal() || self.controller.is_claimed() {
            return Err(self.invalid("expand its command line"));
        }

        let expanded = template::expand(
            &self.descriptor.start_command,
            self.descriptor.shard_id,
            self.ports.as_ref(),
        )?;
        if !self.controller.adopt_leases(&expanded.ports) {
            return Err(self.invalid("expand its command line"));
        }

        tracing::debug!(
            task_id = %self.task_id(),
            command = %expanded.command,
            ports = ?expanded.ports,
            "Command line expanded"
        );
        *expansion = Some(expanded.clone());
        Ok(expanded)
    }

    /// Expand the command, launch it and start supervision. `Staged -> Running`.
    ///
    /// Expansion and launch failures move the task straight to `Failed`
    /// (status written, ports released) and are also returned.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        self.require(TaskState::Staged, "run")?;

        let expanded = match self.expand_command_line() {
            Ok(expanded) => expanded,
            Err(e) => {
                self.controller
                    .terminate(Termination::aborted(e.to_string()))
                    .await;
                return Err(e);
            }
        };

        let handle = match launcher::launch(
            &self.sandbox,
            &expanded.command,
            self.capabilities.pid_resolver.as_ref(),
        )
        .await
        {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(task_id = %self.task_id(), error = %e, "Task launch failed");
                self.controller
                    .terminate(Termination::aborted(e.to_string()))
                    .await;
                return Err(e.into());
            }
        };

        let pid = handle.pid;
        self.controller.set_pid(pid);
        let running = self.controller.advance(TaskState::Running);

        let mut child = handle.into_child();
        if !running {
            tracing::info!(task_id = %self.task_id(), pid, "Task terminated during launch");
            launcher::force_kill(&mut child);
        }
        tokio::spawn(launcher::monitor(
            child,
            self.controller.clone(),
            self.config.kill_grace,
        ));
        if !running {
            return Ok(());
        }

        tracing::info!(
            task_id = %self.task_id(),
            shard_id = self.descriptor.shard_id,
            job = %self.descriptor.job_name,
            pid,
            "Task running"
        );

        if let Some(interval) = self.descriptor.health_check_interval() {
            let target = expanded
                .port(HEALTH_PORT_NAME)
                .map(HealthTarget::Port)
                .unwrap_or(HealthTarget::Pid(pid));
            let supervisor = HealthSupervisor {
                task_id: self.task_id().to_string(),
                target,
                interval,
                check_timeout: self.config.health_check_timeout,
                failure_threshold: self.config.health_failure_threshold,
                checker: self.capabilities.health_checker.clone(),
                controller: self.controller.clone(),
            };
            tokio::spawn(supervisor.run());
        }

        Ok(())
    }

    /// Wait for the terminal state. There is no timeout; bounding the run
    /// time is up to the caller.
    pub async fn wait_for(&self) -> TaskState {
        self.controller.wait_terminal().await
    }

    /// Request termination as `state` (normally `Killed`).
    ///
    /// Safe to call repeatedly and concurrently; the kill capability runs at
    /// most once. Returns once the task's terminal state has been recorded,
    /// whichever caller recorded it.
    pub async fn terminate(&self, state: TaskState) -> Result<()> {
        if !state.is_terminal() {
            return Err(self.invalid("terminate into a non-terminal state"));
        }
        if !self
            .controller
            .terminate(Termination::requested(state))
            .await
        {
            self.controller.wait_terminal().await;
        }
        Ok(())
    }

    fn require(&self, expected: TaskState, action: &'static str) -> Result<()> {
        if self.state() == expected && !self.controller.is_claimed() {
            Ok(())
        } else {
            Err(self.invalid(action))
        }
    }

    fn invalid(&self, action: &'static str) -> ExecutorError {
        ExecutorError::InvalidState {
            task_id: self.task_id().to_string(),
            action,
            state: self.state(),
        }
    }
}

impl std::fmt::Debug for RunningTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningTask")
            .field("task_id", &self.descriptor.task_id)
            .field("state", &self.state())
            .field("root", &self.sandbox.root())
            .finish()
    }
}
