//! Test harness for task execution integration tests.
//!
//! Provides recording stand-ins for every task capability and the port
//! leaser, plus helpers for building tasks on temporary roots.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::future::Future;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use nomad_lite_executor::config::ExecutorConfig;
use nomad_lite_executor::error::PortLeaseError;
use nomad_lite_executor::ports::{PortLeaser, PortPool};
use nomad_lite_executor::task::capability::{
    CopyError, CopyRequest, FileCopier, HealthCheckError, HealthChecker, HealthTarget, KillError,
    PidError, PidResolver, ProcessKiller,
};
use nomad_lite_executor::task::{RunningTask, TaskCapabilities, TaskDescriptor};

/// Ordered record of side effects shared between mocks.
pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn events(log: &EventLog) -> Vec<String> {
    log.lock().clone()
}

/// Port pool that records every lease and release as `lease:<port>` /
/// `release:<port>`.
pub struct RecordingPorts {
    pool: PortPool,
    log: EventLog,
}

impl RecordingPorts {
    pub fn new(range: RangeInclusive<u16>, log: EventLog) -> Self {
        Self {
            pool: PortPool::new(range),
            log,
        }
    }

    pub fn pool(&self) -> &PortPool {
        &self.pool
    }

    pub fn released(&self) -> Vec<u16> {
        self.ports_for("release:")
    }

    pub fn leases(&self) -> Vec<u16> {
        self.ports_for("lease:")
    }

    fn ports_for(&self, prefix: &str) -> Vec<u16> {
        self.log
            .lock()
            .iter()
            .filter_map(|e| e.strip_prefix(prefix))
            .filter_map(|p| p.parse().ok())
            .collect()
    }
}

impl PortLeaser for RecordingPorts {
    fn lease(&self) -> Result<u16, PortLeaseError> {
        let port = self.pool.lease()?;
        self.log.lock().push(format!("lease:{}", port));
        Ok(port)
    }

    fn release(&self, port: u16) {
        self.pool.release(port);
        self.log.lock().push(format!("release:{}", port));
    }
}

/// Always reports the same pid, regardless of the pidfile.
pub struct FixedPidResolver {
    pub pid: u32,
    pub calls: AtomicUsize,
}

impl FixedPidResolver {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PidResolver for FixedPidResolver {
    async fn resolve(&self, _pidfile: &Path) -> Result<u32, PidError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.pid)
    }
}

/// Gives up after `delay`, as a resolver timing out would.
#[derive(Default)]
pub struct FailingPidResolver {
    pub delay: Duration,
}

impl FailingPidResolver {
    pub fn after(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl PidResolver for FailingPidResolver {
    async fn resolve(&self, pidfile: &Path) -> Result<u32, PidError> {
        tokio::time::sleep(self.delay).await;
        Err(PidError::Timeout(pidfile.to_path_buf()))
    }
}

/// Records `kill:<pid>` without signalling anything.
pub struct RecordingKiller {
    log: EventLog,
    pub calls: AtomicUsize,
}

impl RecordingKiller {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessKiller for RecordingKiller {
    async fn kill(&self, pid: u32) -> Result<(), KillError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(format!("kill:{}", pid));
        // Widen the window in which a second terminate could race in.
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(())
    }
}

/// Records `kill:<pid>` and then reports that the process survived.
pub struct FailingKiller {
    log: EventLog,
    pub calls: AtomicUsize,
}

impl FailingKiller {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessKiller for FailingKiller {
    async fn kill(&self, pid: u32) -> Result<(), KillError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(format!("kill:{}", pid));
        Err(KillError::Survived(pid))
    }
}

/// Fails every check and counts them.
#[derive(Default)]
pub struct FailingHealthChecker {
    pub checks: AtomicUsize,
}

impl FailingHealthChecker {
    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthChecker for FailingHealthChecker {
    async fn check(&self, _target: HealthTarget) -> Result<(), HealthCheckError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        Err(HealthCheckError::Unhealthy("forced failure".to_string()))
    }
}

/// Passes every check and remembers what it was aimed at.
#[derive(Default)]
pub struct RecordingHealthChecker {
    pub targets: Mutex<Vec<HealthTarget>>,
}

impl RecordingHealthChecker {
    pub fn targets(&self) -> Vec<HealthTarget> {
        self.targets.lock().clone()
    }
}

#[async_trait]
impl HealthChecker for RecordingHealthChecker {
    async fn check(&self, target: HealthTarget) -> Result<(), HealthCheckError> {
        self.targets.lock().push(target);
        Ok(())
    }
}

pub struct FailingCopier;

#[async_trait]
impl FileCopier for FailingCopier {
    async fn copy(&self, request: &CopyRequest) -> Result<PathBuf, CopyError> {
        Err(CopyError::NotFound(request.source.clone()))
    }
}

/// Config rooted in `root` with short timings for faster tests.
pub fn test_config(root: &Path) -> ExecutorConfig {
    ExecutorConfig::new(root.join("tasks"))
        .with_port_range(41000..=41009)
        .with_port_probe(false)
        .with_health_check_timeout(Duration::from_millis(500))
        .with_pid_resolve_timeout(Duration::from_secs(2))
        .with_kill_grace(Duration::from_millis(200))
}

/// Everything a single-task test needs, with mocks wired to one event log.
pub struct TaskFixture {
    pub dir: TempDir,
    pub config: ExecutorConfig,
    pub log: EventLog,
    pub ports: Arc<RecordingPorts>,
    pub killer: Arc<RecordingKiller>,
    pub pid_resolver: Arc<FixedPidResolver>,
    pub capabilities: TaskCapabilities,
}

pub const MOCK_PID: u32 = 12345;

impl TaskFixture {
    pub fn new() -> Self {
        Self::with_ports(41000..=41009)
    }

    pub fn with_ports(range: RangeInclusive<u16>) -> Self {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path()).with_port_range(range.clone());
        let log = event_log();
        let ports = Arc::new(RecordingPorts::new(range, log.clone()));
        let killer = Arc::new(RecordingKiller::new(log.clone()));
        let pid_resolver = Arc::new(FixedPidResolver::new(MOCK_PID));
        let capabilities = TaskCapabilities::default()
            .with_killer(killer.clone())
            .with_pid_resolver(pid_resolver.clone());

        Self {
            dir,
            config,
            log,
            ports,
            killer,
            pid_resolver,
            capabilities,
        }
    }

    /// Write a file next to the task roots, for use as an artifact.
    pub fn artifact(&self, name: &str, contents: &str) -> String {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path.to_string_lossy().into_owned()
    }

    pub fn task(&self, descriptor: TaskDescriptor) -> Arc<RunningTask> {
        RunningTask::new(
            descriptor,
            &self.config,
            self.ports.clone(),
            self.capabilities.clone(),
        )
    }

    pub fn events(&self) -> Vec<String> {
        events(&self.log)
    }
}

pub fn descriptor(task_id: &str, command: &str) -> TaskDescriptor {
    TaskDescriptor::new(task_id, 0, "tester", "test-job", command)
}

/// Read a pid that a task command wrote into `path`, waiting for it to appear.
pub async fn read_pid_file(path: &Path) -> u32 {
    for _ in 0..100 {
        if let Ok(raw) = std::fs::read_to_string(path) {
            if let Ok(pid) = raw.trim().parse() {
                return pid;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no pid written to {}", path.display());
}

/// True while `pid` is alive. A zombie waiting to be reaped counts as dead.
pub fn process_running(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .map(|rest| !rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
        Err(_) => false,
    }
}

/// Assert that `dir` contains exactly `expected` entries.
pub fn assert_dir_contents(dir: &Path, expected: &[&str]) {
    let actual: BTreeSet<String> = std::fs::read_dir(dir)
        .unwrap_or_else(|e| panic!("cannot read {}: {}", dir.display(), e))
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    let expected: BTreeSet<String> = expected.iter().map(|s| s.to_string()).collect();
    assert_eq!(actual, expected, "unexpected contents of {}", dir.display());
}

/// Poll until a condition is true or timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert that a condition becomes true within timeout
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(50)).await;
    assert!(result, "{}", message);
}
