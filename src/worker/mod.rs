//! Node-level task hosting.
//!
//! A worker node may run many tasks at once. [`TaskExecutor`] owns the
//! node's shared [`PortPool`](crate::ports::PortPool) and capability set,
//! tracks every task from launch until it is terminal, and reports each
//! terminal outcome as a [`TaskUpdate`] to whoever assigned the work.
//!
//! # Execution Flow
//!
//! 1. The scheduler hands over a [`TaskDescriptor`](crate::task::TaskDescriptor)
//! 2. [`TaskExecutor::launch`] stages and runs a [`RunningTask`](crate::task::RunningTask)
//! 3. A reaper waits for the terminal state and sends a [`TaskUpdate`]
//! 4. [`TaskExecutor::kill`] and [`TaskExecutor::shutdown`] go through the
//!    same termination path as a natural exit

pub mod executor;

pub use executor::{TaskExecutor, TaskUpdate};
