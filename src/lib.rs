pub mod config;
pub mod error;
pub mod ports;
pub mod shutdown;
pub mod task;
pub mod worker;

pub use config::ExecutorConfig;
pub use error::{ExecutorError, LaunchError, PortLeaseError, Result, StagingError};
pub use ports::{PortLeaser, PortPool};
pub use task::{RunningTask, TaskCapabilities, TaskDescriptor, TaskState};
pub use worker::{TaskExecutor, TaskUpdate};
