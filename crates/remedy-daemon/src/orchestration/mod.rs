//! Task orchestration: worker slots, the scheduler and the task executor.
//!
//! - [`WorkerSlots`]: fixed-size pool bounding how many tasks run at once.
//! - [`Scheduler`]: owns every task, dequeues in FIFO order into free slots,
//!   supervises workers and publishes events.
//! - [`TaskRunner`] / [`ExecutionContext`]: what a worker slot runs.
//! - [`TaskExecutor`]: the default runner driving the capability interfaces.

pub mod executor;
pub mod pool;
pub mod scheduler;
pub mod worker;

pub use executor::TaskExecutor;
pub use pool::WorkerSlots;
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerError, SchedulerStats};
pub use worker::{ExecutionContext, TaskRunner};
