//! Per-task execution engine.
//!
//! A [`RunningTask`] drives one task assignment through its lifecycle:
//!
//! 1. **Stage**: [`Sandbox::stage`] creates `<root>/<task_id>/`, dumps the
//!    descriptor and copies artifacts in
//! 2. **Expand**: [`template::expand`] rewrites `%shard_id%` and
//!    `%port:<name>%` placeholders, leasing ports
//! 3. **Launch**: [`launcher::launch`] writes `run.sh`, spawns it and
//!    resolves the pid; a monitor task waits for exit
//! 4. **Supervise**: [`HealthSupervisor`] probes the task on an interval
//! 5. **Terminate**: [`TerminationController`] kills, releases ports and
//!    writes `task.status`, exactly once
//!
//! # States
//!
//! ```text
//! PENDING -> STAGED -> RUNNING -> FINISHED | FAILED
//!               |         |
//!               +---------+----> FAILED (launch/health) | KILLED | LOST
//! ```

pub mod capability;
pub mod descriptor;
pub mod health;
pub mod launcher;
pub mod running;
pub mod sandbox;
pub mod template;
pub mod termination;

pub use capability::{HealthTarget, TaskCapabilities};
pub use descriptor::{TaskDescriptor, TaskState, TaskStatusRecord};
pub use health::HealthSupervisor;
pub use running::RunningTask;
pub use sandbox::Sandbox;
pub use template::ExpandedCommand;
pub use termination::{Termination, TerminationController};
