//! Pluggable capabilities a task depends on.
//!
//! The engine never copies files, resolves pids, sends signals or probes
//! health itself; it calls through these traits. Each has a production
//! implementation here, and tests substitute their own.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};

#[derive(Error, Debug)]
pub enum CopyError {
    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Failed to copy {source_ref}: {reason}")]
    Io { source_ref: String, reason: String },
}

#[derive(Error, Debug)]
pub enum PidError {
    #[error("Timed out waiting for a pid in {0}")]
    Timeout(PathBuf),

    #[error("Pidfile {path} holds no valid pid: {content:?}")]
    Invalid { path: PathBuf, content: String },
}

#[derive(Error, Debug)]
pub enum KillError {
    #[error("Failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("Process {0} still alive after SIGKILL")]
    Survived(u32),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HealthCheckError {
    #[error("Unhealthy: {0}")]
    Unhealthy(String),

    #[error("Health check timed out")]
    Timeout,
}

/// A request to place one artifact in the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRequest {
    pub source: String,
    pub dest: PathBuf,
}

/// What a health check is aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTarget {
    Pid(u32),
    Port(u16),
}

#[async_trait]
pub trait FileCopier: Send + Sync {
    /// Fetch `request.source` to `request.dest`, returning the local path.
    async fn copy(&self, request: &CopyRequest) -> Result<PathBuf, CopyError>;
}

#[async_trait]
pub trait PidResolver: Send + Sync {
    async fn resolve(&self, pidfile: &Path) -> Result<u32, PidError>;
}

#[async_trait]
pub trait ProcessKiller: Send + Sync {
    async fn kill(&self, pid: u32) -> Result<(), KillError>;
}

#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check(&self, target: HealthTarget) -> Result<(), HealthCheckError>;
}

/// The capability set injected into every task.
#[derive(Clone)]
pub struct TaskCapabilities {
    pub copier: Arc<dyn FileCopier>,
    pub pid_resolver: Arc<dyn PidResolver>,
    pub killer: Arc<dyn ProcessKiller>,
    pub health_checker: Arc<dyn HealthChecker>,
}

impl TaskCapabilities {
    /// Production capabilities with the given timing.
    pub fn local(
        pid_resolve_timeout: Duration,
        kill_grace: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            copier: Arc::new(LocalFileCopier),
            pid_resolver: Arc::new(PidFileResolver::new(pid_resolve_timeout)),
            killer: Arc::new(SignalKiller::new(kill_grace)),
            health_checker: Arc::new(ProbeHealthChecker::new(probe_timeout)),
        }
    }

    pub fn with_copier(mut self, copier: Arc<dyn FileCopier>) -> Self {
        self.copier = copier;
        self
    }

    pub fn with_pid_resolver(mut self, resolver: Arc<dyn PidResolver>) -> Self {
        self.pid_resolver = resolver;
        self
    }

    pub fn with_killer(mut self, killer: Arc<dyn ProcessKiller>) -> Self {
        self.killer = killer;
        self
    }

    pub fn with_health_checker(mut self, checker: Arc<dyn HealthChecker>) -> Self {
        self.health_checker = checker;
        self
    }
}

impl Default for TaskCapabilities {
    fn default() -> Self {
        Self::local(
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
    }
}

/// Copies artifacts that are reachable on the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileCopier;

#[async_trait]
impl FileCopier for LocalFileCopier {
    async fn copy(&self, request: &CopyRequest) -> Result<PathBuf, CopyError> {
        let source = Path::new(&request.source);
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(CopyError::NotFound(request.source.clone()));
        }

        tokio::fs::copy(source, &request.dest)
            .await
            .map_err(|e| CopyError::Io {
                source_ref: request.source.clone(),
                reason: e.to_string(),
            })?;

        tracing::debug!(
            source = %request.source,
            dest = %request.dest.display(),
            "Artifact copied"
        );
        Ok(request.dest.clone())
    }
}

/// Polls a pidfile until the launch script has written its pid.
#[derive(Debug, Clone)]
pub struct PidFileResolver {
    timeout: Duration,
    poll_interval: Duration,
}

impl PidFileResolver {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            poll_interval: Duration::from_millis(20),
        }
    }
}

#[async_trait]
impl PidResolver for PidFileResolver {
    async fn resolve(&self, pidfile: &Path) -> Result<u32, PidError> {
        let deadline = Instant::now() + self.timeout;
        let mut last_content = String::new();

        loop {
            if let Ok(content) = tokio::fs::read_to_string(pidfile).await {
                // The script may still be mid-write; only a newline-terminated pid is final.
                if content.ends_with('\n') {
                    return match content.trim().parse::<u32>() {
                        Ok(pid) if pid > 0 => Ok(pid),
                        _ => Err(PidError::Invalid {
                            path: pidfile.to_path_buf(),
                            content,
                        }),
                    };
                }
                last_content = content;
            }

            if Instant::now() >= deadline {
                if !last_content.is_empty() {
                    return Err(PidError::Invalid {
                        path: pidfile.to_path_buf(),
                        content: last_content,
                    });
                }
                return Err(PidError::Timeout(pidfile.to_path_buf()));
            }
            sleep(self.poll_interval).await;
        }
    }
}

/// SIGTERM to the task's process group, SIGKILL after a grace period.
#[derive(Debug, Clone)]
pub struct SignalKiller {
    grace: Duration,
    poll_interval: Duration,
}

impl SignalKiller {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            poll_interval: Duration::from_millis(50),
        }
    }

    async fn wait_gone(&self, pid: u32, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        while Instant::now() < deadline {
            if !process_alive(pid) {
                return true;
            }
            sleep(self.poll_interval).await;
        }
        !process_alive(pid)
    }
}

#[async_trait]
impl ProcessKiller for SignalKiller {
    async fn kill(&self, pid: u32) -> Result<(), KillError> {
        if !signal_group_or_pid(pid, libc::SIGTERM)? {
            tracing::debug!(pid, "Process already gone before SIGTERM");
            return Ok(());
        }
        if self.wait_gone(pid, self.grace).await {
            return Ok(());
        }

        tracing::warn!(
            pid,
            grace_ms = self.grace.as_millis() as u64,
            "Process ignored SIGTERM, sending SIGKILL"
        );
        if !signal_group_or_pid(pid, libc::SIGKILL)? {
            return Ok(());
        }
        if self.wait_gone(pid, Duration::from_secs(1)).await {
            Ok(())
        } else {
            Err(KillError::Survived(pid))
        }
    }
}

/// Port targets get a TCP connect to localhost, pid targets a liveness probe.
#[derive(Debug, Clone)]
pub struct ProbeHealthChecker {
    connect_timeout: Duration,
}

impl ProbeHealthChecker {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl HealthChecker for ProbeHealthChecker {
    async fn check(&self, target: HealthTarget) -> Result<(), HealthCheckError> {
        match target {
            HealthTarget::Port(port) => {
                let connect = TcpStream::connect(("127.0.0.1", port));
                match timeout(self.connect_timeout, connect).await {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(e)) => Err(HealthCheckError::Unhealthy(format!(
                        "connect to port {port}: {e}"
                    ))),
                    Err(_) => Err(HealthCheckError::Timeout),
                }
            }
            HealthTarget::Pid(pid) => {
                if process_alive(pid) {
                    Ok(())
                } else {
                    Err(HealthCheckError::Unhealthy(format!("pid {pid} is not running")))
                }
            }
        }
    }
}

/// Returns `Ok(false)` if neither the group nor the pid exists.
fn signal_group_or_pid(pid: u32, signal: libc::c_int) -> Result<bool, KillError> {
    let raw = pid as libc::pid_t;
    for target in [-raw, raw] {
        // SAFETY: kill(2) has no memory-safety preconditions
        let rc = unsafe { libc::kill(target, signal) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(KillError::Signal { pid, source: err });
        }
    }
    Ok(false)
}

/// SIGKILL every member of the process group led by `pgid`. Returns
/// `Ok(false)` if the group no longer exists. Never falls back to the bare
/// pid, so it is safe to call after the leader has been reaped.
pub(crate) fn kill_process_group(pgid: u32) -> Result<bool, KillError> {
    // SAFETY: kill(2) has no memory-safety preconditions
    let rc = unsafe { libc::kill(-(pgid as libc::pid_t), libc::SIGKILL) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(KillError::Signal {
            pid: pgid,
            source: err,
        })
    }
}

fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn pidfile_resolver_reads_pid() {
        let dir = TempDir::new().unwrap();
        let pidfile = dir.path().join("pidfile");
        tokio::fs::write(&pidfile, "12345\n").await.unwrap();

        let resolver = PidFileResolver::new(Duration::from_millis(200));
        assert_eq!(resolver.resolve(&pidfile).await.unwrap(), 12345);
    }

    #[tokio::test]
    async fn pidfile_resolver_waits_for_late_write() {
        let dir = TempDir::new().unwrap();
        let pidfile = dir.path().join("pidfile");
        let writer_path = pidfile.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(60)).await;
            tokio::fs::write(writer_path, "77\n").await.unwrap();
        });

        let resolver = PidFileResolver::new(Duration::from_secs(2));
        assert_eq!(resolver.resolve(&pidfile).await.unwrap(), 77);
    }

    #[tokio::test]
    async fn pidfile_resolver_times_out() {
        let dir = TempDir::new().unwrap();
        let resolver = PidFileResolver::new(Duration::from_millis(50));
        let err = resolver.resolve(&dir.path().join("pidfile")).await.unwrap_err();
        assert!(matches!(err, PidError::Timeout(_)));
    }

    #[tokio::test]
    async fn pidfile_resolver_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let pidfile = dir.path().join("pidfile");
        tokio::fs::write(&pidfile, "not-a-pid\n").await.unwrap();

        let resolver = PidFileResolver::new(Duration::from_millis(50));
        let err = resolver.resolve(&pidfile).await.unwrap_err();
        assert!(matches!(err, PidError::Invalid { .. }));
    }

    #[tokio::test]
    async fn local_copier_copies_file() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("artifact.tar");
        tokio::fs::write(&source, b"payload").await.unwrap();
        let dest = dir.path().join("copy.tar");

        let copied = LocalFileCopier
            .copy(&CopyRequest {
                source: source.display().to_string(),
                dest: dest.clone(),
            })
            .await
            .unwrap();
        assert_eq!(copied, dest);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn local_copier_missing_source() {
        let dir = TempDir::new().unwrap();
        let err = LocalFileCopier
            .copy(&CopyRequest {
                source: "/definitely/not/here".into(),
                dest: dir.path().join("x"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CopyError::NotFound(_)));
    }

    #[tokio::test]
    async fn probe_checker_port_target() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let checker = ProbeHealthChecker::new(Duration::from_millis(500));

        assert!(checker.check(HealthTarget::Port(port)).await.is_ok());
        drop(listener);
        assert!(checker.check(HealthTarget::Port(port)).await.is_err());
    }

    #[tokio::test]
    async fn probe_checker_pid_target() {
        let checker = ProbeHealthChecker::new(Duration::from_millis(500));
        assert!(checker
            .check(HealthTarget::Pid(std::process::id()))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn signal_killer_terminates_process() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        let reaper = tokio::spawn(async move { child.wait().await });
        SignalKiller::new(Duration::from_secs(2)).kill(pid).await.unwrap();

        let status = reaper.await.unwrap().unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn signal_killer_missing_pid_is_ok() {
        // Reaped child: its pid no longer names a process or group.
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();

        assert!(SignalKiller::new(Duration::from_millis(100)).kill(pid).await.is_ok());
    }
}
