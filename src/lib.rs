//! Thread-backed task queues that run one task function over many call
//! descriptors on a bounded worker pool.
//!
//! [`BoundedTaskQueue`] yields `(result, task_id)` pairs in completion order and
//! fails fast (or skips failures) on the first task error.
//! [`SimpleBoundedTaskQueue`] discards results and only logs failures.

mod bounded;
mod config;
mod error;
mod notifier;
mod pending;
mod simple;
mod task;
mod work_queue;

pub use bounded::{BoundedTaskQueue, Results};
pub use config::{default_max_concurrency, ErrorPolicy, QueueConfig, QueueConfigBuilder, ShutdownMode, MAX_DEFAULT_CONCURRENCY};
pub use error::{QueueError, TaskError};
pub use notifier::{TaskCompletionInfo, TaskCompletionStatus};
pub use simple::{SimpleBoundedTaskQueue, SubmitSummary};
pub use task::{BoxError, CallDescriptor, CallProducer, TaskFn};
