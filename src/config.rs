use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

/// Default parent directory for task roots.
pub const DEFAULT_EXECUTION_ROOT: &str = "/tmp/nomad-lite-executor";

/// Smallest accepted failure threshold: a single failed health check is always tolerated.
pub const MIN_HEALTH_FAILURE_THRESHOLD: u32 = 2;

/// Node-level settings shared by every task this executor runs.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Directory under which each task gets a root named by its task id
    pub execution_root: PathBuf,
    /// Ports handed out to `%port:<name>%` placeholders
    pub port_range: RangeInclusive<u16>,
    /// Skip ports that something else on the host has already bound
    pub probe_ports: bool,
    /// Consecutive failed health checks that count as sustained failure
    pub health_failure_threshold: u32,
    /// Upper bound for a single health check; an overrun counts as a failure
    pub health_check_timeout: Duration,
    /// How long to wait for the launch script to publish its pid
    pub pid_resolve_timeout: Duration,
    /// How long a terminated task's process may linger before it is force-killed
    pub kill_grace: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            execution_root: PathBuf::from(DEFAULT_EXECUTION_ROOT),
            port_range: 31000..=31999,
            probe_ports: true,
            health_failure_threshold: MIN_HEALTH_FAILURE_THRESHOLD,
            health_check_timeout: Duration::from_secs(5),
            pid_resolve_timeout: Duration::from_secs(5),
            kill_grace: Duration::from_secs(5),
        }
    }
}

impl ExecutorConfig {
    pub fn new(execution_root: impl Into<PathBuf>) -> Self {
        Self {
            execution_root: execution_root.into(),
            ..Default::default()
        }
    }

    pub fn with_port_range(mut self, range: RangeInclusive<u16>) -> Self {
        self.port_range = range;
        self
    }

    pub fn with_port_probe(mut self, probe: bool) -> Self {
        self.probe_ports = probe;
        self
    }

    /// Values below [`MIN_HEALTH_FAILURE_THRESHOLD`] are raised to it.
    pub fn with_health_failure_threshold(mut self, threshold: u32) -> Self {
        self.health_failure_threshold = threshold.max(MIN_HEALTH_FAILURE_THRESHOLD);
        self
    }

    pub fn with_health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = timeout;
        self
    }

    pub fn with_pid_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.pid_resolve_timeout = timeout;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Root directory for a given task id.
    pub fn task_root(&self, task_id: &str) -> PathBuf {
        self.execution_root.join(task_id)
    }
}
