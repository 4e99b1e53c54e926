//! The single exit funnel for a task.
//!
//! Natural exit, a failing health check, an external kill and an aborted
//! launch all end up in [`TerminationController::terminate`]. The first caller
//! claims the funnel and runs kill, port release, status persistence and state
//! publication in that order; every later caller is turned away.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::ports::PortLeaser;
use crate::task::capability::ProcessKiller;
use crate::task::descriptor::{TaskState, TaskStatusRecord};
use crate::task::sandbox::Sandbox;

/// A request to move a task into a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    pub state: TaskState,
    pub exit_code: Option<i32>,
    pub cause: Option<String>,
    /// Invoke the kill capability if the process is still alive
    pub kill: bool,
}

impl Termination {
    /// The process exited on its own.
    pub fn exited(code: i32) -> Self {
        let (state, cause) = if code == 0 {
            (TaskState::Finished, None)
        } else {
            (TaskState::Failed, Some(format!("exit code {code}")))
        };
        Self {
            state,
            exit_code: Some(code),
            cause,
            kill: false,
        }
    }

    /// Caller-requested termination (usually `Killed`).
    pub fn requested(state: TaskState) -> Self {
        Self {
            state,
            exit_code: None,
            cause: Some(format!("termination requested as {state}")),
            kill: true,
        }
    }

    pub fn unhealthy(cause: impl Into<String>) -> Self {
        Self {
            state: TaskState::Failed,
            exit_code: None,
            cause: Some(cause.into()),
            kill: true,
        }
    }

    /// The task never reached `Running`.
    pub fn aborted(cause: impl Into<String>) -> Self {
        Self {
            state: TaskState::Failed,
            exit_code: None,
            cause: Some(cause.into()),
            kill: false,
        }
    }

    /// The process can no longer be observed.
    pub fn lost(cause: impl Into<String>) -> Self {
        Self {
            state: TaskState::Lost,
            exit_code: None,
            cause: Some(cause.into()),
            kill: true,
        }
    }
}

#[derive(Debug, Default)]
struct ProcessInfo {
    pid: Option<u32>,
    exit_code: Option<i32>,
    exited: bool,
}

/// Owns a task's state channel and the resources that must be given back
/// when it ends.
pub struct TerminationController {
    task_id: String,
    status_file: PathBuf,
    killer: Arc<dyn ProcessKiller>,
    ports: Arc<dyn PortLeaser>,
    claimed: AtomicBool,
    stop: CancellationToken,
    state: watch::Sender<TaskState>,
    leases: Mutex<HashMap<String, u16>>,
    process: Mutex<ProcessInfo>,
}

impl TerminationController {
    pub fn new(
        task_id: impl Into<String>,
        sandbox: &Sandbox,
        killer: Arc<dyn ProcessKiller>,
        ports: Arc<dyn PortLeaser>,
    ) -> Self {
        let (state, _) = watch::channel(TaskState::Pending);
        Self {
            task_id: task_id.into(),
            status_file: sandbox.status_file(),
            killer,
            ports,
            claimed: AtomicBool::new(false),
            stop: CancellationToken::new(),
            state,
            leases: Mutex::new(HashMap::new()),
            process: Mutex::new(ProcessInfo::default()),
        }
    }

    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TaskState> {
        self.state.subscribe()
    }

    /// Move along `Pending -> Staged -> Running`. Returns false if the
    /// transition is not allowed from the current state.
    pub fn advance(&self, next: TaskState) -> bool {
        if self.is_claimed() {
            return false;
        }
        self.state.send_if_modified(|current| {
            if current.can_advance_to(next) {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Cancelled as soon as termination is claimed.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Take ownership of leases granted to this task. If termination has
    /// already been claimed the ports go straight back to the pool and
    /// false is returned.
    pub fn adopt_leases(&self, ports: &HashMap<String, u16>) -> bool {
        let mut leases = self.leases.lock();
        if self.is_claimed() {
            for port in ports.values() {
                self.ports.release(*port);
            }
            return false;
        }
        leases.extend(ports.iter().map(|(name, port)| (name.clone(), *port)));
        true
    }

    pub fn leased_ports(&self) -> HashMap<String, u16> {
        self.leases.lock().clone()
    }

    pub fn set_pid(&self, pid: u32) {
        self.process.lock().pid = Some(pid);
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.lock().pid
    }

    /// Record that the process is gone, with its exit code.
    pub fn process_exited(&self, exit_code: Option<i32>) {
        let mut process = self.process.lock();
        process.exited = true;
        if process.exit_code.is_none() {
            process.exit_code = exit_code;
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.process.lock().exit_code
    }

    /// Wait until a terminal state has been published.
    pub async fn wait_terminal(&self) -> TaskState {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            // The sender lives as long as `self`, so this is unreachable in practice.
            Err(_) => TaskState::Lost,
        };
        state
    }

    /// Run the kill / release / persist sequence. Returns false if another
    /// caller already claimed termination.
    pub async fn terminate(&self, mut termination: Termination) -> bool {
        if self.claimed.swap(true, Ordering::AcqRel) {
            tracing::debug!(
                task_id = %self.task_id,
                requested = %termination.state,
                "Termination already claimed, ignoring"
            );
            return false;
        }
        self.stop.cancel();

        let (pid, exited) = {
            let process = self.process.lock();
            (process.pid, process.exited)
        };
        if termination.kill {
            match pid {
                Some(pid) if !exited => {
                    tracing::info!(task_id = %self.task_id, pid, "Killing task process");
                    if let Err(e) = self.killer.kill(pid).await {
                        tracing::warn!(
                            task_id = %self.task_id,
                            pid,
                            error = %e,
                            "Kill failed, continuing cleanup"
                        );
                    }
                }
                _ => tracing::debug!(task_id = %self.task_id, "No live process to kill"),
            }
        }

        let leases: Vec<(String, u16)> = self.leases.lock().drain().collect();
        for (name, port) in &leases {
            self.ports.release(*port);
            tracing::debug!(
                task_id = %self.task_id,
                port_name = %name,
                port,
                "Released task port"
            );
        }

        match termination.exit_code {
            Some(code) => {
                self.process.lock().exit_code.get_or_insert(code);
            }
            None => termination.exit_code = self.exit_code(),
        }
        let record = TaskStatusRecord {
            task_id: self.task_id.clone(),
            state: termination.state,
            exit_code: termination.exit_code,
            cause: termination.cause.clone(),
            finished_at: Utc::now(),
        };
        if let Err(e) = self.persist(&record).await {
            tracing::error!(
                task_id = %self.task_id,
                path = %self.status_file.display(),
                error = %e,
                "Failed to write task status"
            );
        }

        self.state.send_replace(termination.state);
        tracing::info!(
            task_id = %self.task_id,
            state = %termination.state,
            exit_code = ?termination.exit_code,
            cause = ?termination.cause,
            released_ports = leases.len(),
            "Task terminated"
        );
        true
    }

    async fn persist(&self, record: &TaskStatusRecord) -> std::io::Result<()> {
        let body = serde_json::to_vec_pretty(record)?;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.status_file)
            .await?;
        file.write_all(&body).await?;
        file.flush().await
    }
}
