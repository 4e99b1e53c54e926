use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};

use crate::config::MIN_HEALTH_FAILURE_THRESHOLD;
use crate::task::capability::{HealthCheckError, HealthChecker, HealthTarget};
use crate::task::termination::{Termination, TerminationController};

/// Periodically probes a running task and fails it after sustained failure.
pub struct HealthSupervisor {
    pub task_id: String,
    pub target: HealthTarget,
    pub interval: Duration,
    pub check_timeout: Duration,
    /// Consecutive failures that trigger termination; never below
    /// [`MIN_HEALTH_FAILURE_THRESHOLD`]
    pub failure_threshold: u32,
    pub checker: Arc<dyn HealthChecker>,
    pub controller: Arc<TerminationController>,
}

impl HealthSupervisor {
    /// Runs until the task leaves `Running` by any path, or until it fails
    /// the task itself.
    pub async fn run(self) {
        let stop = self.controller.stop_token();
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let threshold = self.failure_threshold.max(MIN_HEALTH_FAILURE_THRESHOLD);
        let mut failures: u32 = 0;

        tracing::debug!(
            task_id = %self.task_id,
            target = ?self.target,
            interval_ms = self.interval.as_millis() as u64,
            "Health supervisor started"
        );

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                result = timeout(self.check_timeout, self.checker.check(self.target)) => {
                    result.unwrap_or(Err(HealthCheckError::Timeout))
                }
            };

            match result {
                Ok(()) => {
                    if failures > 0 {
                        tracing::info!(task_id = %self.task_id, failures, "Task healthy again");
                    }
                    failures = 0;
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        task_id = %self.task_id,
                        failures,
                        threshold,
                        error = %e,
                        "Health check failed"
                    );
                    if failures >= threshold {
                        let cause = format!("{failures} consecutive health check failures: {e}");
                        self.controller.terminate(Termination::unhealthy(cause)).await;
                        break;
                    }
                }
            }
        }

        tracing::debug!(task_id = %self.task_id, "Health supervisor stopped");
    }
}
