use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::error::LaunchError;
use crate::task::capability::{kill_process_group, PidResolver};
use crate::task::sandbox::{Sandbox, RUN_SCRIPT};
use crate::task::termination::{Termination, TerminationController};

/// A spawned task process whose pid has been resolved.
#[derive(Debug)]
pub struct ProcessHandle {
    pub pid: u32,
    child: Child,
}

impl ProcessHandle {
    pub fn into_child(self) -> Child {
        self.child
    }
}

/// Write `run.sh`, spawn it inside the sandbox and resolve its pid.
///
/// The script runs in its own process group so a kill can reach anything it
/// forks. If the pid cannot be resolved the child is killed and reaped.
pub async fn launch(
    sandbox: &Sandbox,
    command: &str,
    resolver: &dyn PidResolver,
) -> Result<ProcessHandle, LaunchError> {
    let script = sandbox.run_script();
    write_script(&script, &launch_script(&sandbox.pid_file(), command)).await?;

    let stdout = std::fs::File::create(sandbox.stdout_file()).map_err(LaunchError::Spawn)?;
    let stderr = std::fs::File::create(sandbox.stderr_file()).map_err(LaunchError::Spawn)?;

    let mut child = Command::new("/bin/sh")
        .arg(RUN_SCRIPT)
        .current_dir(sandbox.work_dir())
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .process_group(0)
        .spawn()
        .map_err(LaunchError::Spawn)?;

    tracing::debug!(
        script = %script.display(),
        os_pid = ?child.id(),
        "Launch script spawned"
    );

    match resolver.resolve(&sandbox.pid_file()).await {
        Ok(pid) => Ok(ProcessHandle { pid, child }),
        Err(e) => {
            force_kill(&mut child);
            let _ = child.wait().await;
            Err(e.into())
        }
    }
}

/// Block until the process exits and feed the outcome into the termination funnel.
///
/// If termination is claimed elsewhere first, the process gets `grace` to go
/// away on its own before the direct child is force-killed, so it is always
/// reaped.
pub async fn monitor(mut child: Child, controller: Arc<TerminationController>, grace: Duration) {
    let stop = controller.stop_token();
    let pgid = child.id();

    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => {
                let code = exit_code(status);
                controller.process_exited(Some(code));
                controller.terminate(Termination::exited(code)).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Lost track of task process");
                controller.terminate(Termination::lost(format!("wait failed: {e}"))).await;
            }
        },
        _ = stop.cancelled() => {
            let status = match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::warn!(
                        grace_ms = grace.as_millis() as u64,
                        "Task process outlived termination, force-killing"
                    );
                    force_kill(&mut child);
                    child.wait().await
                }
            };
            // The script may have exited and left forked children behind.
            if let Some(pgid) = pgid {
                sweep_group(pgid);
            }
            controller.process_exited(status.ok().map(exit_code));
        }
    }
}

/// SIGKILL the child's whole process group, then the child itself.
///
/// Must be called before the child is reaped; the caller still has to wait on it.
pub fn force_kill(child: &mut Child) {
    if let Some(pgid) = child.id() {
        sweep_group(pgid);
    }
    let _ = child.start_kill();
}

fn sweep_group(pgid: u32) {
    match kill_process_group(pgid) {
        Ok(true) => tracing::debug!(pgid, "Killed task process group"),
        Ok(false) => {}
        Err(e) => tracing::warn!(pgid, error = %e, "Failed to kill task process group"),
    }
}

/// Exit code, or `128 + signal` for a signalled process.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

fn launch_script(pid_file: &Path, command: &str) -> String {
    format!(
        "#!/bin/sh\necho $$ > {}\n{}\n",
        shell_quote(&pid_file.display().to_string()),
        command
    )
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

async fn write_script(path: &Path, body: &str) -> Result<(), LaunchError> {
    let to_err = |source| LaunchError::Script {
        path: path.to_path_buf(),
        source,
    };
    tokio::fs::write(path, body).await.map_err(to_err)?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(to_err)
}
